use bytes::BytesMut;
use clap::{Parser, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use dns_types::protocol::types::{Message, Opcode, Rcode};
use zone_authority::activation::ActivationChecker;
use zone_authority::authority::{Authority, AuthorityConfig};
use zone_authority::cache::{ZoneCache, DEFAULT_CAPACITY};
use zone_authority::events::{EventConsumer, RedisEventPublisher};
use zone_authority::filter::ZoneFilter;
use zone_authority::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes_to};
use zone_authority::store::{PgZoneStore, ZoneStore};

async fn handle_raw_message(authority: Arc<Authority>, buf: &[u8]) -> Option<Message> {
    let res = Message::from_octets(buf);
    tracing::debug!(message = ?res, "got message");

    match res {
        Ok(msg) => {
            if msg.header.is_response {
                Some(Message::make_format_error_response(msg.header.id))
            } else if msg.header.opcode == Opcode::Standard {
                Some(authority.respond(&msg).await)
            } else {
                let mut response = msg.make_response();
                response.header.rcode = Rcode::NotImplemented;
                Some(response)
            }
        }
        Err(err) => err.id().map(Message::make_format_error_response),
    }
}

async fn listen_tcp_task(
    authority: Arc<Authority>,
    socket: TcpListener,
    errors: mpsc::Sender<io::Error>,
) {
    loop {
        match socket.accept().await {
            Ok((mut stream, peer)) => {
                tracing::debug!(?peer, "TCP request");
                let authority = authority.clone();
                tokio::spawn(async move {
                    let response = match read_tcp_bytes(&mut stream).await {
                        Ok(bytes) => handle_raw_message(authority, bytes.as_ref()).await,
                        Err(error) => {
                            tracing::debug!(?peer, ?error, "TCP read error");
                            error.id().map(Message::make_format_error_response)
                        }
                    };
                    if let Some(message) = response {
                        match message.to_octets() {
                            Ok(mut serialised) => {
                                if let Err(error) =
                                    send_tcp_bytes(&mut stream, &mut serialised).await
                                {
                                    tracing::debug!(?peer, ?error, "TCP send error");
                                }
                            }
                            Err(error) => {
                                tracing::warn!(
                                    ?peer,
                                    ?message,
                                    ?error,
                                    "could not serialise message"
                                );
                            }
                        }
                    }
                });
            }
            Err(error) => {
                tracing::error!(?error, "TCP accept error");
                let _ = errors.send(error).await;
                return;
            }
        }
    }
}

async fn listen_udp_task(
    authority: Arc<Authority>,
    socket: UdpSocket,
    errors: mpsc::Sender<io::Error>,
) {
    let (tx, mut rx) = mpsc::channel::<(Message, SocketAddr)>(32);
    let mut buf = vec![0u8; 512];

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((size, peer)) => {
                    tracing::debug!(?peer, "UDP request");
                    let bytes = BytesMut::from(&buf[..size]);
                    let reply = tx.clone();
                    let authority = authority.clone();
                    tokio::spawn(async move {
                        if let Some(response) = handle_raw_message(authority, bytes.as_ref()).await {
                            if let Err(error) = reply.send((response, peer)).await {
                                tracing::debug!(?peer, ?error, "UDP reply channel error");
                            }
                        }
                    });
                }
                Err(error) => {
                    tracing::error!(?error, "UDP receive error");
                    let _ = errors.send(error).await;
                    return;
                }
            },

            Some((message, peer)) = rx.recv() => {
                match message.to_octets() {
                    Ok(mut serialised) => {
                        if let Err(error) = send_udp_bytes_to(&socket, peer, &mut serialised).await {
                            tracing::debug!(?peer, ?error, "UDP send error");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(?peer, ?message, ?error, "could not serialise message");
                    }
                }
            }
        }
    }
}

/// How log lines are rendered.  The filter itself always comes from
/// `RUST_LOG`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    /// The default single-line format
    Full,
    /// Terser single-line format
    Compact,
    /// Multi-line format for humans
    Pretty,
    /// One JSON object per line, for log shippers
    Json,
}

fn begin_logging(args: &Args) {
    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!args.log_no_ansi);

    match (args.log_format, args.log_no_time) {
        (LogFormat::Full, false) => logger.init(),
        (LogFormat::Full, true) => logger.without_time().init(),
        (LogFormat::Compact, false) => logger.compact().init(),
        (LogFormat::Compact, true) => logger.compact().without_time().init(),
        (LogFormat::Pretty, false) => logger.pretty().init(),
        (LogFormat::Pretty, true) => logger.pretty().without_time().init(),
        (LogFormat::Json, false) => logger.json().init(),
        (LogFormat::Json, true) => logger.json().without_time().init(),
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// An authoritative DNS server for hosted zones.
///
/// zoned answers A, CNAME, SOA, NS, and CAA questions for zones held
/// in the record store, flattening CNAMEs through an upstream
/// recursive resolver.  It keeps itself coherent with control-plane
/// edits by consuming the change stream, and flips newly delegated
/// zones active itself.
///
/// It never recurses for clients and never transfers zones.
struct Args {
    /// Interface to listen on
    #[clap(short, long, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Port to listen on, over both UDP and TCP
    #[clap(short, long, value_parser, default_value_t = 53)]
    port: u16,

    /// Recursive resolver used for CNAME flattening and delegation
    /// checks
    #[clap(long, value_parser, default_value = "8.8.8.8:53")]
    upstream: SocketAddr,

    /// How many zones the record cache may hold
    #[clap(long, value_parser, default_value_t = DEFAULT_CAPACITY)]
    cache_capacity: usize,

    /// How many seconds a cached zone record set stays live
    #[clap(long, value_parser, default_value_t = 1800)]
    cache_ttl: u64,

    /// Record store connection string
    #[clap(long, value_parser, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    /// Event bus connection string
    #[clap(long, value_parser, env = "REDIS_URL", hide_env_values = true)]
    redis_url: String,

    /// Primary authoritative nameserver host
    #[clap(long, value_parser, env = "NS1")]
    ns1: String,

    /// Secondary authoritative nameserver host
    #[clap(long, value_parser, env = "NS2")]
    ns2: String,

    /// Responsible mailbox served in SOA answers
    #[clap(long, value_parser, env = "MBOX")]
    mbox: String,

    /// Log output format
    #[clap(long, value_enum, env = "RUST_LOG_FORMAT", default_value = "full")]
    log_format: LogFormat,

    /// Leave timestamps off log lines (for when the collector adds
    /// its own)
    #[clap(long, action(clap::ArgAction::SetTrue))]
    log_no_time: bool,

    /// Disable ANSI colour in log output
    #[clap(long, action(clap::ArgAction::SetTrue))]
    log_no_ansi: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging(&args);

    let Some(config) = AuthorityConfig::from_parts(&args.ns1, &args.ns2, &args.mbox, args.upstream)
    else {
        tracing::error!(ns1 = %args.ns1, ns2 = %args.ns2, mbox = %args.mbox, "nameserver configuration does not parse");
        process::exit(1);
    };

    tracing::info!("connecting to record store");
    let pool = match PgPoolOptions::new().connect(&args.database_url).await {
        Ok(pool) => pool,
        Err(error) => {
            tracing::error!(?error, "could not connect to record store");
            process::exit(1);
        }
    };
    let store: Arc<dyn ZoneStore> = Arc::new(PgZoneStore::new(pool));

    let redis_client = match redis::Client::open(args.redis_url.clone()) {
        Ok(client) => client,
        Err(error) => {
            tracing::error!(?error, "could not parse event bus URL");
            process::exit(1);
        }
    };
    let publisher_connection = match redis::aio::ConnectionManager::new(redis_client.clone()).await
    {
        Ok(connection) => connection,
        Err(error) => {
            tracing::error!(?error, "could not connect to event bus");
            process::exit(1);
        }
    };

    let filter = match store.active_zone_names().await {
        Ok(names) => {
            tracing::info!(zones = names.len(), "seeded zone filter");
            Arc::new(ZoneFilter::from_names(names))
        }
        Err(error) => {
            tracing::error!(?error, "could not scan active zones");
            process::exit(1);
        }
    };

    let cache = Arc::new(ZoneCache::new(
        Arc::clone(&store),
        std::cmp::max(1, args.cache_capacity),
        Duration::from_secs(args.cache_ttl),
    ));
    let authority = Arc::new(Authority::new(
        config,
        Arc::clone(&filter),
        Arc::clone(&cache),
    ));

    tracing::info!(interface = %args.interface, port = %args.port, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((args.interface, args.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(interface = %args.interface, port = %args.port, "binding DNS TCP socket");
    let tcp = match TcpListener::bind((args.interface, args.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    let (error_tx, mut error_rx) = mpsc::channel(2);

    let udp_task = tokio::spawn(listen_udp_task(
        Arc::clone(&authority),
        udp,
        error_tx.clone(),
    ));
    let tcp_task = tokio::spawn(listen_tcp_task(Arc::clone(&authority), tcp, error_tx));

    let consumer = EventConsumer::new(
        redis_client,
        Arc::clone(&cache),
        Arc::clone(&filter),
        Arc::clone(&store),
    );
    let consumer_task = tokio::spawn(consumer.run());

    let checker = Arc::new(ActivationChecker::new(
        Arc::clone(&store),
        Arc::new(RedisEventPublisher::new(publisher_connection)),
        &args.ns1,
        &args.ns2,
        args.upstream,
    ));
    let checker_task = tokio::spawn(checker.run());

    tracing::info!("zoned started");

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGINT");
            process::exit(1);
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };

    let failed = tokio::select! {
        Some(error) = error_rx.recv() => {
            tracing::error!(?error, "listener failed, shutting down");
            true
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
            false
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            false
        }
    };

    // stop accepting new work; in-flight query tasks get whatever time
    // the runtime teardown leaves them
    udp_task.abort();
    tcp_task.abort();
    consumer_task.abort();
    checker_task.abort();

    if failed {
        process::exit(1);
    }
}
