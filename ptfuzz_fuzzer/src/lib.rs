//! ptfuzz, coverage guided fuzzing of kernels and agents inside QEMU-PT

#[macro_use]
pub mod fuzzer_log;
pub mod config;
pub mod mapserver;
pub mod master;
pub mod message;
pub mod radamsa;
pub mod stats;
pub mod transfer;
pub mod util;
pub mod workdir;
pub mod worker;

use crate::{
    config::Config,
    mapserver::run_mapserver,
    master::{wipe_filters, Master, MasterContext},
    stats::Stats,
    transfer::Comm,
    util::{stop_req, stop_soon},
    workdir::WorkDir,
    worker::{run_worker, WorkerContext},
};
use anyhow::Context;
use ptfuzz_core::corpus::TreeConfig;
use qemu_pt::{redqueen::RedqueenState, LookupSet};
use std::{
    fs::read,
    os::raw::c_int,
    sync::{mpsc::channel, Arc},
    thread::{self, sleep},
    time::Duration,
};

pub fn boot(mut config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;
    println!("{}", PTFUZZ);

    let workdir = WorkDir::new(config.work_dir.clone());
    workdir
        .init(config.purge)
        .context("failed to init work dir")?;
    config.fixup()?;
    let agent = read(&config.agent)
        .with_context(|| format!("failed to read agent {}", config.agent.display()))?;
    let agent = Arc::new(agent);
    let bitmap_size = config.qemu_config.bitmap_size;
    wipe_filters(bitmap_size).context("failed to wipe filters")?;

    let config = Arc::new(config);
    let stats = Arc::new(Stats::new());
    let comm = Arc::new(Comm::new(config.jobs, config.tasks_per_request, bitmap_size));
    let lookup = LookupSet::new();
    let redqueen = RedqueenState::new();

    setup_signal_handler();
    let reporter = Arc::clone(&stats);
    let stats_path = workdir.stats_path();
    let interval = Duration::from_secs(config.report_interval);
    thread::spawn(move || reporter.report(interval, Some(&stats_path)));

    let (master_tx, master_rx) = channel();
    let (reply_tx, reply_rx) = channel();
    let (mapserver_tx, mapserver_rx) = channel();
    let (mapserver_reply_tx, mapserver_reply_rx) = channel();

    let tree_config = TreeConfig {
        bitmap_size,
        depth_first: config.depth_first,
    };
    let mapserver = {
        let comm = Arc::clone(&comm);
        let workdir = workdir.clone();
        let lookup = lookup.clone();
        let stats = Arc::clone(&stats);
        thread::spawn(move || {
            run_mapserver(
                comm,
                workdir,
                lookup,
                stats,
                tree_config,
                mapserver_rx,
                mapserver_reply_tx,
            )
        })
    };

    log::info!("booting {} vms...", config.jobs);
    let mut workers = Vec::with_capacity(config.jobs);
    let mut worker_txs = Vec::with_capacity(config.jobs);
    for id in 0..config.jobs {
        let (tx, rx) = channel();
        worker_txs.push(tx);
        let ctx = WorkerContext {
            id,
            agent: Arc::clone(&agent),
            comm: Arc::clone(&comm),
            stats: Arc::clone(&stats),
            lookup: lookup.clone(),
            redqueen: redqueen.clone(),
            rx,
            master: master_tx.clone(),
            replies: reply_tx.clone(),
            mapserver: mapserver_tx.clone(),
        };
        let worker_config = Arc::clone(&config);
        workers.push(thread::spawn(move || run_worker(&worker_config, ctx)));
        if id != config.jobs - 1 {
            sleep(Duration::from_millis(500)); // slow down
        }
        if stop_soon() {
            break;
        }
    }
    drop(master_tx);
    drop(reply_tx);

    let ctx = MasterContext {
        comm,
        stats: Arc::clone(&stats),
        redqueen,
        workdir: workdir.clone(),
        workers: worker_txs.clone(),
        rx: master_rx,
        replies: reply_rx,
        mapserver: mapserver_tx.clone(),
        mapserver_rx: mapserver_reply_rx,
    };
    let master = Master::new(Arc::clone(&config), ctx).context("failed to setup master")?;
    let master_ret = master.run();
    // a failed master takes everyone down
    stop_req();
    for tx in &worker_txs {
        let _ = tx.send(message::WorkerMsg::Shutdown);
    }
    let _ = mapserver_tx.send(message::MapserverMsg::Shutdown);

    let mut err = None;
    let mut push_err = |who: String, e: anyhow::Error| {
        let msg = err.get_or_insert_with(|| "fuzzer exits with errors:".to_string());
        msg.push_str(&format!("\n\t{}: {}", who, e));
        for (i, cause) in e.chain().enumerate().skip(1) {
            msg.push_str(&format!("\n\t\t{}. {}", i, cause));
        }
    };
    if let Err(e) = master_ret {
        push_err("master".to_string(), e);
    }
    for (i, w) in workers.into_iter().enumerate() {
        if let Ok(Err(e)) = w.join() {
            push_err(format!("worker-{}", i), e);
        }
    }
    if let Ok(Err(e)) = mapserver.join() {
        push_err("mapserver".to_string(), e);
    }

    if let Err(e) = stats.save(&workdir.stats_path()) {
        log::warn!("failed to save stats: {}", e);
    }
    match err {
        None => {
            log::info!("All done");
            Ok(())
        }
        Some(e) => Err(anyhow::anyhow!(e)),
    }
}

fn setup_signal_handler() {
    use signal_hook::consts::*;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = match SignalsInfo::<WithOrigin>::new(TERM_SIGNALS) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to setup signal handler: {}", e);
            return;
        }
    };
    thread::spawn(move || {
        for (n, info) in signals.forever().enumerate() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}",
                named_signal(info.signal),
                from,
                info.cause
            );
            if n == 0 {
                println!("please waiting vms to exit...");
                stop_req();
            } else {
                std::process::exit(1);
            }
        }
    });
}

const PTFUZZ: &str = r"
        __    ____
 ____  / /_  / __/_  __________
/ __ \/ __/ / /_/ / / /_  /_  /
/ /_/ / /_  / __/ /_/ / / /_/ /_
/ .___/\__/ /_/  \__,_/ /___/___/
/_/
";
