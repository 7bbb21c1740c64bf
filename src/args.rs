//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Center frequency in Hz
    #[clap(short, long)]
    pub freq: f64,
    /// Sample rate in samples per second, also the length of each file in samples
    #[clap(short, long, value_parser = positive_rate)]
    pub rate: f64,
    /// Receive gain in dB
    #[clap(short, long)]
    pub gain: f64,
    /// LO offset in Hz used while tuning
    #[clap(long, default_value_t = 0.0)]
    pub lo_offset: f64,
    /// Receive channel
    #[clap(long, default_value_t = 0)]
    pub channel: usize,
    /// Directory to write `<timetag>.bin` files into
    #[clap(short, long, default_value = ".")]
    pub output: PathBuf,
    /// Stop after this many seconds (whole buffers) instead of running until ctrl-c
    #[clap(short, long)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub duration: Option<u64>,
    /// Skip disciplining the boards to GPS
    #[clap(long)]
    pub no_gps_sync: bool,
    /// Capture from a simulated radio instead of real hardware
    #[clap(long)]
    pub simulate: bool,
    /// Number of simulated boards
    #[clap(long, default_value_t = 1)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub boards: u16,
    /// SoapySDR device arguments (e.g. "driver=uhd,addr=192.168.10.2"), one per board
    #[clap(long)]
    pub device: Vec<String>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn positive_rate(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(rate) if rate.is_finite() && rate >= 1.0 => Ok(rate),
        Ok(_) => Err("Sample rate must be at least 1".to_string()),
        Err(_) => Err("Invalid sample rate".to_string()),
    }
}
