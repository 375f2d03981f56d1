//! `rtcshare start`: run the broker and supervise the front-end collaborator.
//!
//! Binds the loopback listener first so the chosen port can be passed to the
//! collaborator through `RTCSHARE_SOCKET_PORT` (with the shared root in
//! `RTCSHARE_DIR`). Runs until interrupted or until the collaborator exits.

use std::{
   path::{Path, PathBuf},
   process::{ExitStatus, Stdio},
   time::Duration,
};

use console::style;
use tokio::{
   io::{AsyncBufReadExt, AsyncRead, BufReader},
   process::{Child, Command},
   signal,
   sync::watch,
   time,
};

use crate::{
   Error, Result,
   config::{self, Framing},
   dispatch::Dispatcher,
   path::PathResolver,
   server::{self, ServerOptions},
   service::ServiceRegistry,
   socket::Listener,
   video,
};

pub const ENV_SOCKET_PORT: &str = "RTCSHARE_SOCKET_PORT";
pub const ENV_SHARED_DIR: &str = "RTCSHARE_DIR";

/// Command-line overrides for `start`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
   pub dir:     PathBuf,
   pub port:    Option<u16>,
   pub framing: Option<Framing>,
   /// Collaborator program and arguments; empty falls back to configuration.
   pub command: Vec<String>,
}

/// Substitutes `{dir}` and `{port}` in each argument.
pub fn collaborator_args(template: &[String], dir: &Path, port: u16) -> Vec<String> {
   let dir = dir.display().to_string();
   let port = port.to_string();
   template
      .iter()
      .map(|arg| arg.replace("{dir}", &dir).replace("{port}", &port))
      .collect()
}

/// The supervised front-end process
struct Collaborator {
   child: Child,
}

impl Collaborator {
   fn spawn(args: &[String], dir: &Path, port: u16) -> Result<Self> {
      let Some((program, rest)) = args.split_first() else {
         return Err(Error::Server { op: "spawn", reason: "empty collaborator command".to_string() });
      };

      let mut child = Command::new(program)
         .args(rest)
         .env(ENV_SOCKET_PORT, port.to_string())
         .env(ENV_SHARED_DIR, dir)
         .stdin(Stdio::null())
         .stdout(Stdio::piped())
         .stderr(Stdio::piped())
         .kill_on_drop(true)
         .spawn()
         .map_err(Error::CollaboratorSpawn)?;

      if let Some(stdout) = child.stdout.take() {
         tokio::spawn(forward_lines(stdout));
      }
      if let Some(stderr) = child.stderr.take() {
         tokio::spawn(forward_lines(stderr));
      }

      tracing::info!("started collaborator {program} (pid {:?})", child.id());
      Ok(Self { child })
   }

   async fn wait(&mut self) -> std::io::Result<ExitStatus> {
      self.child.wait().await
   }

   /// Sends SIGTERM, waits up to `grace`, then kills.
   async fn terminate(&mut self, grace: Duration) {
      if let Ok(Some(_)) = self.child.try_wait() {
         return;
      }

      #[cfg(unix)]
      if let Some(pid) = self.child.id() {
         let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
         if rc != 0 {
            tracing::debug!("SIGTERM to {pid} failed: {}", std::io::Error::last_os_error());
         }
      }

      match time::timeout(grace, self.child.wait()).await {
         Ok(Ok(status)) => tracing::debug!("collaborator exited: {status}"),
         _ => {
            tracing::warn!("collaborator did not exit within {}ms, killing", grace.as_millis());
            if let Err(e) = self.child.kill().await {
               tracing::warn!("failed to kill collaborator: {e}");
            }
         },
      }
   }
}

async fn forward_lines<R>(reader: R)
where
   R: AsyncRead + Unpin,
{
   let mut lines = BufReader::new(reader).lines();
   loop {
      match lines.next_line().await {
         Ok(Some(line)) => println!("{line}"),
         Ok(None) => break,
         Err(e) => {
            tracing::debug!("collaborator output closed: {e}");
            break;
         },
      }
   }
}

#[cfg(unix)]
async fn terminate_signal() {
   match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut sigterm) => {
         sigterm.recv().await;
      },
      Err(e) => {
         tracing::warn!("cannot listen for SIGTERM: {e}");
         std::future::pending::<()>().await;
      },
   }
}

#[cfg(not(unix))]
async fn terminate_signal() {
   std::future::pending::<()>().await;
}

async fn wait_collaborator(collaborator: &mut Option<Collaborator>) -> std::io::Result<ExitStatus> {
   match collaborator {
      Some(c) => c.wait().await,
      None => std::future::pending().await,
   }
}

/// Executes the start command with an empty service registry.
pub async fn execute(opts: StartOptions) -> Result<()> {
   execute_with(opts, ServiceRegistry::default()).await
}

/// Executes the start command with externally contributed services.
pub async fn execute_with(opts: StartOptions, registry: ServiceRegistry) -> Result<()> {
   let cfg = config::get();
   let paths = PathResolver::new(&opts.dir)?;
   let root = paths.root().to_path_buf();

   let options = ServerOptions {
      framing: opts.framing.unwrap_or(cfg.framing),
      ..ServerOptions::from_config(cfg)
   };

   let listener = Listener::bind(opts.port.unwrap_or(cfg.port)).await?;
   let port = listener.port();

   println!("{}", style("Starting rtcshare broker...").green().bold());
   println!("Listening: {}", style(listener.local_addr()).cyan());
   println!("Shared dir: {}", style(root.display()).dim());
   tracing::debug!(?registry, framing = ?options.framing, "broker configured");

   let dispatcher = Dispatcher::new(paths, registry, video::default_backend())
      .with_timeout(server::request_timeout(cfg));

   let (shutdown_tx, shutdown_rx) = watch::channel(false);
   let accept_handle = server::spawn(listener, dispatcher, options, shutdown_rx);

   let template = if opts.command.is_empty() {
      cfg.collaborator_command.clone()
   } else {
      opts.command
   };
   let mut collaborator = if template.is_empty() {
      println!("{}", style("No collaborator configured; serving until interrupted").dim());
      None
   } else {
      let args = collaborator_args(&template, &root, port);
      match Collaborator::spawn(&args, &root, port) {
         Ok(c) => Some(c),
         Err(e) => {
            let _ = shutdown_tx.send(true);
            let _ = accept_handle.await;
            return Err(e);
         },
      }
   };

   println!("{}", style("Press Ctrl+C to stop").dim());

   tokio::select! {
      _ = signal::ctrl_c() => {
         println!("\n{}", style("Shutting down...").yellow());
      }
      () = terminate_signal() => {
         println!("\n{}", style("Terminated, shutting down...").yellow());
      }
      status = wait_collaborator(&mut collaborator) => {
         match status {
            Ok(status) => match status.code() {
               Some(code) => println!("Process exited with return code {code}"),
               None => println!("Process exited: {status}"),
            },
            Err(e) => tracing::error!("failed to wait for collaborator: {e}"),
         }
      }
   }

   let _ = shutdown_tx.send(true);
   if let Err(e) = accept_handle.await {
      tracing::debug!("accept task ended abnormally: {e}");
   }

   if let Some(c) = collaborator.as_mut() {
      c.terminate(Duration::from_millis(cfg.shutdown_grace_ms)).await;
   }

   println!("{}", style("Broker stopped").green());
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn substitutes_dir_and_port() {
      let template = vec![
         "node".to_string(),
         "index.js".to_string(),
         "--dir={dir}".to_string(),
         "--port".to_string(),
         "{port}".to_string(),
      ];
      let args = collaborator_args(&template, Path::new("/srv/share"), 4100);
      assert_eq!(args, vec!["node", "index.js", "--dir=/srv/share", "--port", "4100"]);
   }
}
