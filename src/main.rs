use std::{error::Error, path::PathBuf, process::ExitCode, sync::Arc};
use bayeux_server::{
    config::{Options, ServerOptions},
    connection::{LongPollingTransport, Proxy},
    message_broker::BrokerMediator,
    server::{CertificatePath, Server},
};
use clap::Parser;
use tokio::{runtime, select, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// bayeux server over http long-polling
#[derive(Debug, Parser)]
#[command(name = "bayeux-server", version)]
struct Args {
    /// address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// json file of server and transport options
    #[arg(long)]
    config: Option<PathBuf>,

    /// pem certificate chain, enables tls together with --key
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// pkcs8 pem private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let options = match &args.config {
        Some(path) => Options::load(path),
        None => Ok(Options::new()),
    };
    let (options, server_options) = match options.and_then(|o| ServerOptions::resolve(&o).map(|s| (o, s))) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("[config] error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&server_options.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let build_rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build();

    let rt = match build_rt {
        Ok(v) => v,
        Err(e) => {
            error!("[runtime] error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(app(args, options)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[server] error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn app(args: Args, options: Options) -> Result<(), Box<dyn Error>> {
    let broker = BrokerMediator::new(&options)?;
    let sweeper = broker.join_handle();
    let transport = LongPollingTransport::new(broker.clone(), &options)?;

    let mut server = Server::new(Proxy::new(Arc::new(transport)));
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        server = server.with_tls(&CertificatePath::new(cert, key))?;
    }
    let listening = server.bind(args.bind.as_str()).await?;
    info!("[server] running on {}", listening.local_addr);

    let outcome = select! {
        joined = listening.task => match joined {
            Ok(served) => served.map_err(Into::into),
            Err(e) => Err(e.into()),
        },
        _ = signal::ctrl_c() => {
            info!("[server] shutdown");
            Ok(())
        }
    };

    broker.close();
    let _ = sweeper.await;
    outcome
}
