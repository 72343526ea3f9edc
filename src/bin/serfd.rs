// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `serfd` drives `serf_core`'s lifecycle from the command line: create a
//! node, optionally join a seed list, print membership and event traffic,
//! and leave cleanly on Ctrl-C.
//!
//! This binary deliberately does not reimplement the full Serf CLI surface
//! (`members`, `event`, `query`, `keys`, `monitor`, `rtt`, ...) documented at
//! spec.md §6 — that command parser, its JSON config loader, and the
//! event-handler script invocation are out-of-scope boundary collaborators.
//! `serfd` only exercises `create`/`join`/`leave`/`shutdown` end to end, the
//! same role the teacher's `sn_node` binary plays for `routing::Core`.

use eyre::{Result, WrapErr};
use serf_core::config::Config;
use serf_core::event::{ChannelEventSink, Event, MemberEventType};
use serf_core::Coordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

#[derive(StructOpt, Debug)]
#[structopt(name = "serfd", about = "Run a serf_core cluster node")]
struct Opt {
    /// Unique node name advertised to the cluster.
    #[structopt(long)]
    name: String,

    /// UDP+TCP bind address, e.g. 127.0.0.1:7946.
    #[structopt(long, default_value = "0.0.0.0:7946")]
    bind: SocketAddr,

    /// Address advertised to peers, if different from `--bind`
    /// (e.g. behind NAT). Defaults to `--bind`.
    #[structopt(long)]
    advertise: Option<SocketAddr>,

    /// Seed addresses to join at startup.
    #[structopt(long)]
    join: Vec<SocketAddr>,

    /// Path to the append-only snapshot log (§4.J). Omit to disable
    /// crash-recovery snapshotting entirely.
    #[structopt(long)]
    snapshot: Option<std::path::PathBuf>,

    /// Path to the persisted keyring file (§4.I). Omit to disable
    /// encryption and persistence of the keyring.
    #[structopt(long)]
    keyring_file: Option<std::path::PathBuf>,

    /// Base64-independent raw key bytes (16/24/32) to seed the keyring
    /// with on first start. Hex-encoded on the command line.
    #[structopt(long, parse(try_from_str = parse_hex_key))]
    encrypt_key: Option<Vec<u8>>,

    /// Network label (§4.A) prepended to every frame; peers with a
    /// different label silently reject our traffic and vice versa.
    #[structopt(long)]
    label: Option<String>,

    /// `key=value` tags attached to the local node, repeatable.
    #[structopt(long, parse(try_from_str = parse_tag))]
    tag: Vec<(String, String)>,

    /// Write structured logs to this directory instead of stdout.
    #[structopt(long)]
    log_dir: Option<std::path::PathBuf>,
}

fn parse_hex_key(src: &str) -> Result<Vec<u8>, String> {
    hex::decode(src).map_err(|e| format!("invalid hex key: {}", e))
}

fn parse_tag(src: &str) -> Result<(String, String), String> {
    match src.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("tag {:?} is not in key=value form", src)),
    }
}

fn init_logging(log_dir: &Option<std::path::PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "serfd.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let opt = Opt::from_args();
    let _log_guard = init_logging(&opt.log_dir);

    let mut config = Config::new(opt.name.clone(), opt.bind);
    if let Some(advertise) = opt.advertise {
        config.advertise_addr = advertise;
    }
    config.tcp_bind_addr = config.bind_addr;
    config.snapshot_path = opt.snapshot;
    config.keyring_file = opt.keyring_file;
    config.encrypt_key = opt.encrypt_key;
    config.label = opt.label;
    config.tags = opt.tag.into_iter().collect();
    config.validate().wrap_err("invalid configuration")?;

    let (sink, mut events) = ChannelEventSink::new(256);
    let coordinator = Coordinator::create(config, Some(Arc::new(sink)))
        .await
        .wrap_err("failed to start node")?;
    info!(name = %opt.name, bind = %opt.bind, "node started");

    if !opt.join.is_empty() {
        let joined = coordinator.join(&opt.join).await.wrap_err("join failed")?;
        info!(joined, attempted = opt.join.len(), "join complete");
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Member(m) => match m.event_type {
                    MemberEventType::Join => info!(members = ?m.members, "member joined"),
                    MemberEventType::Leave => info!(members = ?m.members, "member left"),
                    MemberEventType::Failed => warn!(members = ?m.members, "member failed"),
                    MemberEventType::Update => info!(members = ?m.members, "member updated"),
                    MemberEventType::Reap => info!(members = ?m.members, "member reaped"),
                },
                Event::User(u) => info!(name = %u.name, ltime = u.ltime, "user event"),
                Event::Query(q) => info!(name = %q.name, ltime = q.ltime, "query received"),
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("ctrl-c received, leaving cluster");
    coordinator.leave().await.ok();
    coordinator.shutdown().await;
    printer.abort();

    Ok(())
}
