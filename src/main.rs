use clap::{
    Parser,
    Subcommand,
};
use color_eyre::eyre::Error;
use saws_ingest::{
    api::Api,
    database::Database,
    publisher::Publisher,
    reprocess::{
        ReprocessOptions,
        reprocess,
    },
    server::IngestServer,
    sink::ObservationSink,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let database = Database::connect(&args.database_url).await?;

    match args.command {
        Command::Serve {
            listen_address,
            api_address,
            nats_url,
        } => {
            serve(database, listen_address, api_address, nats_url).await?;
        }
        Command::Reprocess { options } => {
            reprocess(&database, &options).await?;
        }
    }

    Ok(())
}

async fn serve(
    database: Database,
    listen_address: String,
    api_address: String,
    nats_url: Option<String>,
) -> Result<(), Error> {
    let publisher = match &nats_url {
        Some(nats_url) => Some(Publisher::connect(nats_url).await?),
        None => {
            tracing::info!("no NATS url configured, observations will not be published");
            None
        }
    };

    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(?error, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        });
    }

    let tcp_listener = TcpListener::bind(&listen_address).await?;
    tracing::info!(%listen_address, "listening for mobile-originated messages");

    let sink = ObservationSink::new(database.clone(), publisher.clone());
    let server = IngestServer::new(tcp_listener, sink).with_shutdown(shutdown.clone());

    let api = Api::new(database, publisher).with_shutdown(shutdown);
    tracing::info!(%api_address, "serving http api");
    let api_task = tokio::spawn(async move { api.serve(&api_address).await });

    server.serve().await?;
    api_task.await??;

    Ok(())
}

#[derive(Debug, Parser)]
pub struct Args {
    #[clap(long, env = "DATABASE_URL")]
    database_url: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Serve {
        /// Address to listen on for DirectIP messages
        #[clap(long, default_value = "0.0.0.0:10800")]
        listen_address: String,

        /// Address to serve the HTTP API on
        #[clap(long, default_value = "localhost:8080")]
        api_address: String,

        /// NATS server to publish observations to
        #[clap(long, env = "NATS_URL")]
        nats_url: Option<String>,
    },
    Reprocess {
        #[clap(flatten)]
        options: ReprocessOptions,
    },
}
