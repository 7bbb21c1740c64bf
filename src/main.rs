use anyhow::Context;
use clap::Parser;
use sample_slurper::{
    args,
    config::RadioConfig,
    exfil::FileSink,
    gps::DisciplineSettings,
    hardware::RadioSession,
    receiver::Receiver,
    sim::{SimBoardConfig, SimRadioConfig, SimulatedRadio},
};
use tracing::{info, warn};

fn run<S: RadioSession>(session: S, cli: &args::Args) -> anyhow::Result<()> {
    let mut rx = Receiver::new(session);
    rx.initialize().context("Failed to identify the radio")?;

    let config = RadioConfig {
        center_freq: cli.freq,
        sample_rate: cli.rate,
        gain: cli.gain,
        lo_offset: cli.lo_offset,
        channel: cli.channel,
    };
    rx.apply(config).context("Failed to configure the radio")?;
    rx.validate()
        .context("Radio did not take the requested settings")?;

    if cli.no_gps_sync {
        warn!("Skipping GPS sync, file time tags come from free-running board clocks");
    } else {
        let report = rx
            .sync_to_gps(&DisciplineSettings::default())
            .context("GPS sync")?;
        if report.timestamps_trusted() {
            info!("All boards are on GPS time");
        }
    }

    let sink = FileSink::new(&cli.output)
        .with_context(|| format!("Can't use {} for output", cli.output.display()))?;
    let pipeline = rx.prepare_capture(cli.duration)?;

    // Stop cleanly on ctrl-c, letting the last full buffer hit the disk
    let token = pipeline.cancel_token();
    ctrlc::set_handler(move || token.cancel()).context("Failed to set ctrl-c handler")?;

    info!("Capturing to {}", cli.output.display());
    let report = rx.start(&pipeline, sink)?;
    report.log_summary();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = args::Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(cli.verbose.log_level_filter()))
        .init();

    if cli.simulate {
        let radio = SimulatedRadio::new(SimRadioConfig {
            boards: vec![SimBoardConfig::default(); cli.boards as usize],
            realtime: true,
            noise: true,
            ..Default::default()
        });
        return run(radio, &cli);
    }

    #[cfg(feature = "soapy")]
    {
        let session = sample_slurper::soapy::SoapySession::open(&cli.device)
            .context("Failed to open the radio")?;
        run(session, &cli)
    }
    #[cfg(not(feature = "soapy"))]
    {
        anyhow::bail!("Built without hardware support, rebuild with `--features soapy` or pass --simulate")
    }
}
