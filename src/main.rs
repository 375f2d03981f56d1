use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rtcshare::{
   Result,
   cmd::{self, query::QueryOptions, start::StartOptions},
   config::{self, Config, Framing},
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the rtcshare broker
#[derive(Parser)]
#[command(name = "rtcshare")]
#[command(about = "Share a directory tree, video frames and array slices with a front-end process")]
#[command(version)]
struct Cli {
   #[arg(long, global = true, env = "RTCSHARE_CONFIG", help = "Config file (default: ~/.rtcshare/config.toml)")]
   config: Option<PathBuf>,

   #[arg(short, long, global = true, help = "Log at debug level")]
   verbose: bool,

   #[command(subcommand)]
   command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum FramingArg {
   Line,
   LengthPrefixed,
}

impl From<FramingArg> for Framing {
   fn from(value: FramingArg) -> Self {
      match value {
         FramingArg::Line => Self::Line,
         FramingArg::LengthPrefixed => Self::LengthPrefixed,
      }
   }
}

#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Run the broker and launch the front-end collaborator")]
   Start {
      #[arg(long, help = "Shared root directory")]
      dir: PathBuf,

      #[arg(long, help = "Port to bind on 127.0.0.1 (default: ephemeral)")]
      port: Option<u16>,

      #[arg(long, value_enum, help = "Wire framing for accepted connections")]
      framing: Option<FramingArg>,

      #[arg(
         last = true,
         help = "Collaborator command; {dir} and {port} are substituted (default: from config)"
      )]
      command: Vec<String>,
   },

   #[command(about = "Send one service query to a running broker")]
   Query {
      #[arg(long, env = "RTCSHARE_SOCKET_PORT", help = "Broker port")]
      port: u16,

      #[arg(short, long, help = "Service name (test, video, array, ...)")]
      service: String,

      #[arg(short, long, default_value = "{}", help = "Query object as JSON")]
      query: String,

      #[arg(long, default_value = "", help = "Working directory used to expand $dir")]
      dir: String,

      #[arg(long, help = "Caller identity forwarded to the service")]
      user_id: Option<String>,

      #[arg(long, value_enum, default_value = "line", help = "Wire framing")]
      framing: FramingArg,

      #[arg(short, long, help = "Write the binary payload to this file")]
      out: Option<PathBuf>,
   },
}

#[tokio::main]
async fn main() {
   let cli = Cli::parse();

   let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
      .init();

   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   config::init(Config::load_from(cli.config.as_deref())?);

   match cli.command {
      Cmd::Start { dir, port, framing, command } => {
         cmd::start::execute(StartOptions { dir, port, framing: framing.map(Into::into), command }).await
      },
      Cmd::Query { port, service, query, dir, user_id, framing, out } => {
         cmd::query::execute(QueryOptions {
            port,
            framing: framing.into(),
            service,
            query,
            dir,
            user_id,
            out,
         })
         .await
      },
   }
}
