use anyhow::Context;
use arbiter_judge::{config::JudgeConfig, session::Rejected, session::WorkerSession};
use clap::Parser;
use std::{
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};
use tracing::{error, info, warn};
use util::ShutdownFlag;
use wire::Channel;

#[derive(Parser)]
#[clap(name = "arbiter-judge", about = "judging worker for the dispatch server")]
struct Args {
    /// Configuration file path
    #[clap(short, long, default_value = "/etc/arbiter/judge.toml")]
    config: PathBuf,
    /// Stay in the foreground (daemonization is left to the init system)
    #[clap(long)]
    no_daemon: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    util::log::setup();

    let cfg = JudgeConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if !args.no_daemon {
        info!("running in the foreground; supervise with the init system");
    }

    let shutdown = ShutdownFlag::new();
    shutdown
        .register_signals()
        .context("failed to install signal handlers")?;
    let connector = wire::tls::connector(&cfg.tls_identity()).context("tls setup failed")?;
    let compile_lock = Mutex::new(());
    let session = WorkerSession::new(&cfg, &shutdown, &compile_lock);

    while !shutdown.is_set() {
        match connect(&cfg, &connector) {
            Ok(mut chan) => {
                let res = session.run(&mut chan);
                chan.close();
                match res {
                    Ok(()) => break,
                    Err(err) if err.downcast_ref::<Rejected>().is_some() => {
                        error!(error = %format!("{:#}", err), "giving up");
                        return Err(err);
                    }
                    Err(err) => warn!(error = %format!("{:#}", err), "connection lost"),
                }
            }
            Err(err) => warn!(error = %format!("{:#}", err), "could not reach the server"),
        }
        sleep_checking(&shutdown, Duration::from_millis(cfg.reconnect_delay_ms));
    }
    info!("bye");
    Ok(())
}

fn connect(
    cfg: &JudgeConfig,
    connector: &openssl::ssl::SslConnector,
) -> anyhow::Result<Channel<openssl::ssl::SslStream<TcpStream>>> {
    let target = format!("{}:{}", cfg.server_host, cfg.server_port);
    let addr = target
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {}", target))?
        .next()
        .with_context(|| format!("{} resolved to nothing", target))?;
    let stream = TcpStream::connect_timeout(&addr, cfg.network_timeout())
        .with_context(|| format!("cannot connect to {}", target))?;
    stream.set_read_timeout(Some(cfg.network_timeout()))?;
    stream.set_write_timeout(Some(cfg.network_timeout()))?;
    let tls = connector
        .connect(cfg.server_name(), stream)
        .map_err(|e| anyhow::anyhow!("tls handshake with the server failed: {}", e))?;
    info!(server = %target, "transport established");
    Ok(Channel::new(tls, cfg.network_timeout()))
}

fn sleep_checking(shutdown: &ShutdownFlag, total: Duration) {
    let slice = Duration::from_millis(500);
    let mut slept = Duration::from_millis(0);
    while slept < total && !shutdown.is_set() {
        std::thread::sleep(slice);
        slept += slice;
    }
}
