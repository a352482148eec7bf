use anyhow::Context;
use arbiter_server::{
    config::ServerConfig,
    fetch,
    queue::{LangPool, TaskQueue},
    registry::JudgeRegistry,
    session::{self, ServerCtx},
    web::{TaskSourceProvider, WebEndpoint},
};
use clap::Parser;
use std::{
    net::{TcpListener, TcpStream},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};
use util::ShutdownFlag;
use wire::Channel;

/// Accept-loop poll granularity; each slice re-checks the shutdown flag.
const ACCEPT_SLICE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[clap(name = "arbiter-server", about = "central dispatch server for judging workers")]
struct Args {
    /// Configuration file path
    #[clap(short, long, default_value = "/etc/arbiter/server.toml")]
    config: PathBuf,
    /// Stay in the foreground (daemonization is left to the init system)
    #[clap(long)]
    no_daemon: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    util::log::setup();

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if !args.no_daemon {
        info!("running in the foreground; supervise with the init system");
    }

    let shutdown = ShutdownFlag::new();
    shutdown
        .register_signals()
        .context("failed to install signal handlers")?;

    let acceptor = wire::tls::acceptor(&config.tls_identity()).context("tls setup failed")?;
    let endpoint: Arc<WebEndpoint> = Arc::new(WebEndpoint::new(
        config.web_url.clone(),
        config.web_secret.clone(),
        Duration::from_millis(config.web_timeout_ms),
    ));

    let ctx = Arc::new(ServerCtx {
        registry: JudgeRegistry::new(),
        queue: TaskQueue::new(config.queue_size),
        langs: LangPool::new(),
        web: Arc::clone(&endpoint) as Arc<dyn TaskSourceProvider>,
        shutdown: shutdown.clone(),
        config,
    });

    let fetcher = {
        let ctx = Arc::clone(&ctx);
        let refresh = Duration::from_secs(ctx.config.refresh_interval_secs);
        std::thread::spawn(move || {
            let client = ctx.web.connect();
            fetch::run(client, &ctx.queue, &ctx.langs, refresh, &ctx.shutdown);
        })
    };

    let bind_addr = if ctx.config.use_ipv6 {
        format!("[::]:{}", ctx.config.listen_port)
    } else {
        format!("0.0.0.0:{}", ctx.config.listen_port)
    };
    let listener = TcpListener::bind(&bind_addr)
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure listener")?;
    info!(addr = %bind_addr, "listening for judges");

    let mut sessions = Vec::new();
    while !shutdown.is_set() {
        match listener.accept() {
            Ok((socket, addr)) => {
                info!(peer = %addr, "incoming connection");
                let ctx = Arc::clone(&ctx);
                let acceptor = acceptor.clone();
                sessions.push(std::thread::spawn(move || {
                    serve_connection(&ctx, acceptor, socket);
                }));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_SLICE);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(ACCEPT_SLICE);
            }
        }
        sessions.retain(|handle| !handle.is_finished());
    }

    info!("shutdown requested, draining connections");
    for handle in sessions {
        let _ = handle.join();
    }
    let _ = fetcher.join();
    info!("bye");
    Ok(())
}

fn serve_connection(ctx: &ServerCtx, acceptor: openssl::ssl::SslAcceptor, socket: TcpStream) {
    if let Err(err) = socket.set_nonblocking(false) {
        warn!(error = %err, "could not configure accepted socket");
        return;
    }
    // bound the TLS handshake so a silent client cannot pin this thread
    let _ = socket.set_read_timeout(Some(ctx.config.network_timeout()));
    let _ = socket.set_write_timeout(Some(ctx.config.network_timeout()));
    let stream = match acceptor.accept(socket) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "tls handshake failed");
            return;
        }
    };
    let chan = Channel::new(stream, ctx.config.network_timeout());
    session::serve(ctx, chan);
}
