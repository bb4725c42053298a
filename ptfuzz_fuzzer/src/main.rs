use env_logger::{Env, TimestampPrecision};
use ptfuzz_fuzzer::{boot, config::Config};
use ptfuzz_vm::QemuConfig;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
struct Settings {
    /// Directory to write corpus, findings and statistics.
    #[structopt(long, short = "w", default_value = "work")]
    work_dir: PathBuf,
    /// Directory of seed inputs.
    #[structopt(long, short = "i", default_value = "seeds")]
    seed_dir: PathBuf,
    /// Agent executable loaded into every vm.
    #[structopt(long, short = "b", default_value = "agent")]
    binary: PathBuf,
    /// Path to kernel image, booted together with the initrd.
    #[structopt(long, short = "k")]
    kernel: Option<PathBuf>,
    /// Path to initrd.
    #[structopt(long)]
    initrd: Option<PathBuf>,
    /// Memory snapshot file.
    #[structopt(long)]
    ram_file: Option<PathBuf>,
    /// Directory of per vm qcow2 overlays.
    #[structopt(long)]
    overlay_dir: Option<PathBuf>,
    /// Name of the vm snapshot to load, kernel is ignored then.
    #[structopt(long, short = "s")]
    snapshot: Option<String>,
    /// QEMU-PT executable.
    #[structopt(long, default_value = "qemu-system-x86_64")]
    qemu_bin: String,
    /// QEMU mem size in megabyte.
    #[structopt(long, default_value = "300")]
    mem: u32,
    /// Parallel vms.
    #[structopt(long, short = "j", default_value = "4")]
    jobs: usize,
    #[structopt(long, default_value = "65536")]
    bitmap_size: usize,
    /// Runs taking longer than this factor times the sampled average time out.
    #[structopt(long, default_value = "10.0")]
    timeout_tick_factor: f64,
    /// Max delta of arithmetic mutations.
    #[structopt(long, default_value = "35")]
    arith_max: u32,
    /// Share of the measured performance spent on one havoc round.
    #[structopt(long, default_value = "0.5")]
    havoc_multiplier: f64,
    /// Dictionary file, one quoted token per line.
    #[structopt(long)]
    dict: Option<PathBuf>,
    /// Enable input-to-state mutations.
    #[structopt(long)]
    redqueen: bool,
    /// Hammer jump tables found by redqueen.
    #[structopt(long)]
    hammer_jmp_tables: bool,
    /// Patch out compares of checksums, needs redqueen.
    #[structopt(long)]
    fix_hashes: bool,
    /// Skip deterministic mutations of bytes without effect.
    #[structopt(long)]
    effector: bool,
    /// Skip bit flips of zero bytes.
    #[structopt(long)]
    skip_zero: bool,
    /// Explore new nodes depth first.
    #[structopt(long)]
    depth_first: bool,
    /// Add radamsa outputs to the havoc stage.
    #[structopt(long)]
    radamsa: bool,
    #[structopt(long, default_value = "radamsa")]
    radamsa_path: PathBuf,
    /// PT filter range, hex 'start-end'.
    #[structopt(long, parse(try_from_str = parse_range))]
    ip0: Option<(u64, u64)>,
    /// Wipe old results in the work dir.
    #[structopt(long)]
    purge: bool,
    /// Seconds between two performance measurements.
    #[structopt(long, default_value = "1")]
    refresh_rate: u64,
    /// Seconds between two statistics lines.
    #[structopt(long, default_value = "10")]
    report_interval: u64,
    /// Skip benchmark and tick sampling.
    #[structopt(long)]
    disable_sampling: bool,
    /// Candidates per job.
    #[structopt(long, default_value = "1")]
    tasks_per_request: usize,
}

fn parse_range(s: &str) -> anyhow::Result<(u64, u64)> {
    let (a, b) = s
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("expected 'start-end': {}", s))?;
    let hex = |v: &str| u64::from_str_radix(v.trim().trim_start_matches("0x"), 16);
    Ok((hex(a)?, hex(b)?))
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("PTFUZZ_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let config = Config {
        work_dir: settings.work_dir,
        seed_dir: settings.seed_dir,
        agent: settings.binary,
        jobs: settings.jobs,
        timeout_tick_factor: settings.timeout_tick_factor,
        arith_max: settings.arith_max,
        havoc_multiplier: settings.havoc_multiplier,
        dict: settings.dict,
        redqueen: settings.redqueen,
        hammer_jmp_tables: settings.hammer_jmp_tables,
        fix_hashes: settings.fix_hashes,
        effector: settings.effector,
        skip_zero: settings.skip_zero,
        depth_first: settings.depth_first,
        radamsa: settings.radamsa,
        radamsa_path: settings.radamsa_path,
        purge: settings.purge,
        refresh_rate: settings.refresh_rate,
        report_interval: settings.report_interval,
        disable_sampling: settings.disable_sampling,
        tasks_per_request: settings.tasks_per_request,
        qemu_config: QemuConfig {
            qemu_bin: settings.qemu_bin,
            mem: settings.mem,
            ram_file: settings.ram_file,
            overlay_dir: settings.overlay_dir,
            kernel: {
                let snapshot = &settings.snapshot;
                settings.kernel.filter(|_| snapshot.is_none())
            },
            snapshot: settings.snapshot,
            initrd: settings.initrd,
            ip0: settings.ip0,
            bitmap_size: settings.bitmap_size,
            ..Default::default()
        },
    };

    boot(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_range() {
        assert_eq!(parse_range("0x1000-ffff").unwrap(), (0x1000, 0xffff));
        assert!(parse_range("1000").is_err());
        assert!(parse_range("zz-10").is_err());
    }
}
