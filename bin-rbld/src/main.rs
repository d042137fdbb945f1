mod net_util;
mod settings;

use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::interval;
use tracing_subscriber::EnvFilter;

use dns_wire::protocol::types::{QueryClass, QueryType, Rcode, RecordClass, RecordType};
use zone_engine::config::{build_zone_table, Loaded};
use zone_engine::dataset::Dataset;
use zone_engine::dataset_types::example_registry;
use zone_engine::dispatch::dispatch;
use zone_engine::query::parse_query;
use zone_engine::reload::reload_tick;
use zone_engine::zone::ZoneTable;

use net_util::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes_to};
use settings::Settings;

const DNS_PORT: u16 = 53;

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// An authoritative DNS server for blocklist-style zones.
///
/// Answers queries against a set of configured zones backed by flat
/// text files, each watched for changes and reloaded automatically.
struct Args {
    /// Interface to listen on
    #[clap(short, long, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// A zone spec of the form `zone-name:dataset-type:file1,file2,...`.
    /// An empty zone name with an ACL dataset type installs a global
    /// ACL instead of a zone. May be given more than once.
    #[clap(short = 'b', long = "zone", value_parser)]
    zone: Vec<String>,

    /// Path to a YAML settings file supplying `interface` and `zones`;
    /// zones given here and on the command line are both loaded.
    #[clap(long, value_parser)]
    settings: Option<String>,

    /// How often, in seconds, to check dataset source files for
    /// changes, independent of the SIGHUP-triggered check.
    #[clap(long, value_parser, default_value_t = 30)]
    reload_interval_secs: u64,
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("pretty") {
        if log_format.contains("no-time") {
            logger.pretty().without_time().init();
        } else {
            logger.pretty().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

/// `QueryType` has no `Display` impl in the wire codec (only the
/// narrower `RecordType` does), so the per-query log line builds its
/// own names by hand - `type<n>` for anything without one, matching
/// the convention the original log format uses for unknown types.
fn qtype_name(qtype: QueryType) -> String {
    match qtype {
        QueryType::Wildcard => "ANY".to_string(),
        QueryType::AXFR => "AXFR".to_string(),
        QueryType::MAILB => "MAILB".to_string(),
        QueryType::MAILA => "MAILA".to_string(),
        QueryType::Record(RecordType::Unknown(_)) => format!("type{}", u16::from(qtype)),
        QueryType::Record(rtype) => rtype.to_string(),
    }
}

fn qclass_name(qclass: QueryClass) -> String {
    match qclass {
        QueryClass::Wildcard => "ANY".to_string(),
        QueryClass::Record(RecordClass::IN) => "IN".to_string(),
        QueryClass::Record(RecordClass::Unknown(_)) => format!("class{}", u16::from(qclass)),
    }
}

fn rcode_name(rcode: Rcode) -> String {
    match rcode {
        Rcode::NoError => "NOERROR".to_string(),
        Rcode::FormatError => "FORMERR".to_string(),
        Rcode::ServerFailure => "SERVFAIL".to_string(),
        Rcode::NameError => "NXDOMAIN".to_string(),
        Rcode::NotImplemented => "NOTIMPL".to_string(),
        Rcode::Refused => "REFUSED".to_string(),
        Rcode::Reserved(_) => format!("rcode{}", u8::from(rcode)),
    }
}

/// Logs one line per answered query: unix timestamp, client address,
/// query name, query type, query class, response code, answer count,
/// and response length in bytes.
fn log_query(client: SocketAddr, qname: &str, qtype: QueryType, qclass: QueryClass, rcode: Rcode, ancount: usize, response_len: usize) {
    let unix_time = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let qtype = qtype_name(qtype);
    let qclass = qclass_name(qclass);
    let rcode = rcode_name(rcode);
    tracing::info!(
        %client,
        %qname,
        %qtype,
        %qclass,
        %rcode,
        %ancount,
        %response_len,
        "{unix_time} {client} {qname} {qtype} {qclass} {rcode} {ancount} {response_len}"
    );
}

/// Extracts an IPv4 address to check against ACL datasets, which only
/// ever carry IPv4 prefixes. A bare (non-mapped) IPv6 peer has no such
/// address, so it cannot be checked - treated as "no address" rather
/// than allowed or denied, leaving it to whichever ACL (if any) is
/// configured to decide via `client_allowed`'s `None` handling.
fn client_ipv4(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Whether `client` is allowed to query at all, per the global ACL,
/// and, if a zone matched, that zone's own ACL. A configured ACL
/// dataset whose address family can't be determined for this client
/// (an unmapped IPv6 peer) denies rather than silently allowing.
fn client_allowed(global_acl: Option<&Dataset>, zone_acl: Option<&Dataset>, client: Option<Ipv4Addr>) -> bool {
    let check = |acl: &Dataset| match client {
        Some(ip) => acl.type_impl.allows(ip),
        None => false,
    };
    global_acl.map_or(true, check) && zone_acl.map_or(true, check)
}

/// Parses, matches, and dispatches one raw datagram against `zones`,
/// returning the bounded wire bytes to send back - or `None` if the
/// datagram must be silently dropped (too short, malformed, not a
/// query, the wrong question count, or the client is denied by the
/// global or zone ACL).
fn handle_datagram(zones: &ZoneTable, global_acl: Option<&Dataset>, client: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
    let (message, query) = parse_query(datagram).ok()?;

    let zone_acl = zones.find_match(&query.reversed_labels).and_then(|zone| zone.acl.as_deref());
    if !client_allowed(global_acl, zone_acl, client_ipv4(client)) {
        tracing::debug!(%client, "query rejected by acl");
        return None;
    }

    let qname = query.name.to_dotted_string();
    let qtype = query.qtype;
    let qclass = query.qclass;

    let response = dispatch(&message, query, zones);
    let ancount = response.answers.len();
    let rcode = response.header.rcode;

    let (bytes, _dropped_records) = response.serialise_bounded(512).ok()?;
    log_query(client, &qname, qtype, qclass, rcode, ancount, bytes.len());
    Some(bytes)
}

async fn listen_udp_task(zones: Arc<ZoneTable>, global_acl: Option<Arc<Dataset>>, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let mut buf = [0u8; 512];
    loop {
        let (size, peer) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::debug!(?error, "UDP recv error");
                continue;
            }
        };
        let datagram = buf[..size].to_vec();
        let zones = Arc::clone(&zones);
        let global_acl = global_acl.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            if let Some(mut bytes) = handle_datagram(&zones, global_acl.as_deref(), peer, &datagram) {
                if let Err(error) = send_udp_bytes_to(&socket, peer, &mut bytes).await {
                    tracing::debug!(?peer, ?error, "UDP send error");
                }
            }
        });
    }
}

async fn listen_tcp_task(zones: Arc<ZoneTable>, global_acl: Option<Arc<Dataset>>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::debug!(?error, "TCP accept error");
                continue;
            }
        };
        let zones = Arc::clone(&zones);
        let global_acl = global_acl.clone();
        tokio::spawn(handle_tcp_connection(zones, global_acl, stream, peer));
    }
}

async fn handle_tcp_connection(zones: Arc<ZoneTable>, global_acl: Option<Arc<Dataset>>, mut stream: TcpStream, peer: SocketAddr) {
    let datagram = match read_tcp_bytes(&mut stream).await {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::debug!(?peer, ?error, "TCP read error");
            return;
        }
    };
    if let Some(mut bytes) = handle_datagram(&zones, global_acl.as_deref(), peer, &datagram) {
        if let Err(error) = send_tcp_bytes(&mut stream, &mut bytes).await {
            tracing::debug!(?peer, ?error, "TCP send error");
        }
    }
}

/// Runs one reload pass over every distinct dataset, off the async
/// executor - reload does synchronous file I/O and each dataset's own
/// lock bounds how long any one query can block behind it.
async fn run_reload_tick(datasets: &Arc<Vec<Arc<Dataset>>>) {
    let datasets = Arc::clone(datasets);
    if let Err(error) = tokio::task::spawn_blocking(move || {
        reload_tick(datasets.iter().map(Arc::as_ref));
    })
    .await
    {
        tracing::error!(?error, "reload task panicked");
    }
}

async fn reload_task(datasets: Arc<Vec<Arc<Dataset>>>, interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGHUP");
            process::exit(1);
        }
    };
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = sighup.recv() => { tracing::info!("SIGHUP received, checking datasets for changes"); }
        }
        run_reload_tick(&datasets).await;
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    begin_logging();

    let settings = match &args.settings {
        Some(path) => match Settings::new(path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::error!(%error, "could not read settings file");
                process::exit(1);
            }
        },
        None => Settings::default(),
    };

    let mut specs = settings.zones;
    specs.extend(args.zone);
    if specs.is_empty() {
        tracing::error!("no zones configured: pass -b zone-name:type:file1,file2 or a settings file");
        process::exit(1);
    }

    let interface = settings.interface.unwrap_or(args.interface);

    let Loaded { zones, global_acl, datasets } = match build_zone_table(&specs, example_registry) {
        Ok(loaded) => loaded,
        Err(error) => {
            tracing::error!(%error, "invalid zone configuration");
            process::exit(1);
        }
    };
    if global_acl.is_some() {
        tracing::info!("global ACL dataset configured");
    }

    // `datasets` already includes the global ACL dataset (every
    // constructed `(type, spec)` pair lands there regardless of
    // whether it ends up attached to a zone or installed globally),
    // so reload_tick picks it up without any extra wiring here.
    let datasets = Arc::new(datasets);
    tracing::info!(count = %datasets.len(), "loading datasets");
    run_reload_tick(&datasets).await;

    let zones = Arc::new(zones);

    tracing::info!(%interface, port = %DNS_PORT, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((interface, DNS_PORT)).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(%interface, port = %DNS_PORT, "binding DNS TCP socket");
    let tcp = match TcpListener::bind((interface, DNS_PORT)).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    tokio::spawn(listen_udp_task(Arc::clone(&zones), global_acl.clone(), udp));
    tokio::spawn(listen_tcp_task(Arc::clone(&zones), global_acl, tcp));

    reload_task(datasets, args.reload_interval_secs).await;
}
