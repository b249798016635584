mod config;
mod player;
mod socket;
mod stats;
mod sync;
mod time;
mod track;

use std::process::ExitCode;

use structopt::StructOpt;
use thiserror::Error;

#[derive(StructOpt)]
enum Cmd {
    /// Host a room and play a track to it
    Host(sync::HostOpt),
    /// Join a room and follow its host
    Join(sync::JoinOpt),
}

#[derive(StructOpt)]
struct Opt {
    #[structopt(flatten)]
    metrics: stats::server::MetricsOpt,
    #[structopt(flatten)]
    cmd: Cmd,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("opening network socket: {0}")]
    Listen(#[from] socket::ListenError),
    #[error("network transport: {0}")]
    Transport(std::io::Error),
    #[error("player: {0}")]
    Player(#[from] player::PlayerError),
    #[error("preparing track: {0}")]
    Track(#[from] track::TrackError),
    #[error("creating cache directory: {0}")]
    CacheDir(std::io::Error),
    #[error(transparent)]
    Metrics(#[from] stats::server::StartError),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ExitCode> {
    init_log();

    if let Some(config) = config::read() {
        config::load_into_env(&config);
    }

    let opt = Opt::from_args();

    let result = async {
        stats::server::start(&opt.metrics).await?;

        match opt.cmd {
            Cmd::Host(cmd) => sync::run_host(cmd).await,
            Cmd::Join(cmd) => sync::run_client(cmd).await,
        }
    }
    .await;

    result.map_err(|err| {
        log::error!("fatal: {err}");
        ExitCode::FAILURE
    })
}

fn init_log() {
    // millisecond stamps: aligning playback is the whole point
    let default_level = if cfg!(debug_assertions) { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}
