//! pcm-out-hal 演示程序
//!
//! 把文件或测试音通过 HAL 写入虚拟 PCM（或 cpal 设备），
//! 可以周期性切换路由来观察 standby / 重新打开的过程。

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use pcm_out_hal::audio::{
    AudioFormat, PcmBackend, PcmConfiguration, PlaybackStats, VirtualPcmBackend,
};
use pcm_out_hal::decode::{AudioDecoder, PcmSource, ToneSource};
use pcm_out_hal::engine::{AudioDevice, BufferPolicy, DeviceConfig, HalError, SoftMixer};
use pcm_out_hal::resample::ResamplerQuality;

/// 连续这么多次硬件失败后放弃
const MAX_CONSECUTIVE_FAILURES: u32 = 50;

/// Audio output HAL demo
#[derive(Parser)]
#[command(name = "pcm-out-hal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Hardware sample rate
    #[arg(long, default_value = "48000")]
    rate: u32,

    /// Hardware channel count
    #[arg(long, default_value = "2")]
    channels: u16,

    /// Period size in frames
    #[arg(long, default_value = "256")]
    period: usize,

    /// Periods in the short (low latency) buffer
    #[arg(long, default_value = "2")]
    short_periods: usize,

    /// Periods in the long (deep) buffer
    #[arg(long, default_value = "8")]
    long_periods: usize,

    /// Resampler: linear | polynomial
    #[arg(long, default_value = "linear")]
    resampler: String,

    /// Use the long buffer while the screen is off
    #[arg(long)]
    screen_off: bool,

    /// Use a real output device through cpal (optionally by name)
    #[cfg(feature = "cpal")]
    #[arg(long)]
    cpal: Option<Option<String>>,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Info,

    /// Play a file (or a test tone) through the HAL
    Play {
        /// Audio file to play; a test tone when omitted
        file: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<f64>,

        /// Test tone frequency
        #[arg(long, default_value = "440")]
        tone_hz: f64,

        /// Test tone sample rate
        #[arg(long, default_value = "44100")]
        tone_rate: u32,

        /// Toggle speaker / headphone every N milliseconds
        #[arg(long)]
        route_switch_ms: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let config = create_device_config(&cli)?;

    match cli.command {
        Some(Commands::Info) | None => show_info(&config),
        Some(Commands::Play {
            ref file,
            seconds,
            tone_hz,
            tone_rate,
            route_switch_ms,
        }) => {
            let source: Box<dyn PcmSource> = match file {
                Some(path) => Box::new(
                    AudioDecoder::open(path)
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => {
                    let format = AudioFormat::new(tone_rate, config.pcm.channels.max(2), 16);
                    Box::new(ToneSource::new(format, tone_hz, None))
                }
            };
            let options = PlayOptions {
                seconds,
                route_switch: route_switch_ms.map(Duration::from_millis),
                screen_off: cli.screen_off,
            };

            #[cfg(feature = "cpal")]
            if let Some(ref name) = cli.cpal {
                let backend = pcm_out_hal::audio::CpalPcmBackend::new(name.clone());
                let stats = backend.stats();
                return play(backend, stats, config, source, options);
            }

            let backend = VirtualPcmBackend::new();
            let stats = backend.stats();
            play(backend, stats, config, source, options)
        }
    }
}

/// 由命令行参数生成设备配置
fn create_device_config(cli: &Cli) -> anyhow::Result<DeviceConfig> {
    let pcm = PcmConfiguration::standard(
        cli.channels,
        cli.rate,
        cli.period,
        cli.short_periods,
        cli.long_periods,
    );
    let mut config = DeviceConfig::for_pcm(pcm);
    config.resampler = cli.resampler.parse::<ResamplerQuality>()?;
    config.buffer_policy = BufferPolicy {
        long_when_screen_off: cli.screen_off,
    };
    config.validate()?;
    Ok(config)
}

fn show_info(config: &DeviceConfig) -> anyhow::Result<()> {
    let pcm = &config.pcm;
    println!("=== PCM Configuration ===\n");
    println!("  Card/device:     {}:{}", config.card, config.device);
    println!("  Format:          {} {} ch @ {} Hz", pcm.format, pcm.channels, pcm.rate);
    println!(
        "  Period:          {} frames ({:.2} ms)",
        pcm.period_size,
        pcm.period_duration().as_secs_f64() * 1000.0
    );
    println!("  Ring:            {} periods ({} frames)", pcm.period_count, pcm.buffer_frames());
    println!("  Start threshold: {} frames", pcm.start_threshold);
    println!(
        "  Buffer tuning:   short {} / long {} periods",
        config.tuning.short_period_count, config.tuning.long_period_count
    );
    println!("  Resampler:       {:?}", config.resampler);

    let device = AudioDevice::new(
        VirtualPcmBackend::new(),
        config.clone(),
        Box::new(SoftMixer::with_paths(&config.mixer_paths)),
    )?;
    let stream = device.open_output_stream(None)?;
    println!("\n=== Default Stream ===\n");
    println!("  Format:          {:?}", stream.format());
    println!("  Buffer size:     {} bytes", stream.buffer_size());
    println!("  Latency:         {} ms", stream.latency_ms());
    println!("\n=== Device State ===\n");
    println!("{}", device.dump());
    Ok(())
}

struct PlayOptions {
    seconds: Option<f64>,
    route_switch: Option<Duration>,
    screen_off: bool,
}

fn play<B: PcmBackend>(
    backend: B,
    stats: Arc<PlaybackStats>,
    config: DeviceConfig,
    mut source: Box<dyn PcmSource>,
    options: PlayOptions,
) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mixer = Box::new(SoftMixer::with_paths(&config.mixer_paths));
    let period_size = config.pcm.period_size;
    let hw_rate = config.pcm.rate;
    let device = AudioDevice::new(backend, config, mixer)?;
    if options.screen_off {
        device.set_parameters("screen_state=off")?;
    }

    let stream = device.open_output_stream(Some(source.format()))?;
    let format = stream.format();
    if format != source.format() {
        anyhow::bail!(
            "Source format {:?} not accepted (hardware has more channels?)",
            source.format()
        );
    }
    println!(
        "Playing {} Hz, {} ch, {}-bit -> {} Hz (latency {} ms)",
        format.sample_rate,
        format.channels,
        format.bits_per_sample,
        hw_rate,
        stream.latency_ms()
    );

    let limit_frames = options
        .seconds
        .map(|s| (s * format.sample_rate as f64) as u64);
    let chunk_frames = stream.buffer_size() / format.bytes_per_frame().max(1);

    thread::scope(|scope| -> anyhow::Result<()> {
        if let Some(interval) = options.route_switch {
            let device = device.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("route-switch".into())
                .spawn_scoped(scope, move || route_switch_loop(&device, interval, &running))?;
        }

        let mut scratch = Vec::new();
        let mut bytes = Vec::new();
        let mut frames_read = 0u64;
        let mut failures = 0u32;
        let mut last_report = Instant::now();

        while running.load(Ordering::SeqCst) {
            let want = match limit_frames {
                Some(limit) if frames_read >= limit => break,
                Some(limit) => chunk_frames.min((limit - frames_read) as usize),
                None => chunk_frames,
            };
            let n = source.read_bytes(want, &mut scratch, &mut bytes)?;
            if n == 0 {
                break;
            }
            frames_read += format.frames_in(n) as u64;

            match stream.write(&bytes[..n]) {
                Ok(_) => match stream.last_error() {
                    None => failures = 0,
                    Some(e) => {
                        failures += 1;
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            running.store(false, Ordering::SeqCst);
                            return Err(e).context("Output keeps failing");
                        }
                    }
                },
                Err(HalError::Underrun) => {}
                Err(e) => return Err(e).context("Write rejected"),
            }

            if last_report.elapsed() >= Duration::from_secs(1) {
                last_report = Instant::now();
                match stream.presentation_position() {
                    Ok((frames, ts)) => print!(
                        "\rPosition: {:>10} frames @ {}.{:09}   ",
                        frames,
                        ts.secs(),
                        ts.subsec_nanos()
                    ),
                    Err(e) => print!("\rPosition: {}   ", e),
                }
                let _ = std::io::stdout().flush();
            }
        }

        running.store(false, Ordering::SeqCst);
        Ok(())
    })?;

    println!("\n\nWritten: {} frames", stream.frames_written());
    stream.standby();
    println!("{}", stats.report(period_size, hw_rate));
    Ok(())
}

/// 在扬声器和耳机之间来回切换
fn route_switch_loop<B: PcmBackend>(
    device: &AudioDevice<B>,
    interval: Duration,
    running: &AtomicBool,
) {
    let routes = ["routing=2", "routing=8"];
    let mut next = 1;
    while running.load(Ordering::SeqCst) {
        thread::sleep(interval);
        if let Err(e) = device.set_parameters(routes[next]) {
            log::warn!("Route switch failed: {}", e);
        }
        next = 1 - next;
    }
}
