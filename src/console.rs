//! Line-oriented administrative console
//!
//! Grammar, one command per line, tokens separated by whitespace:
//!   add <name> <path> <url>
//!   remove <path>
//!   list
//!   reload
//!   exit

use crate::certificate::CertificateStore;
use crate::routes::RouteTable;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

const BANNER: &str = "Proxy Management CLI\nAvailable commands: add, remove, list, reload, exit\n";
const PROMPT: &str = "> ";

/// One parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { name: String, path: String, url: String },
    Remove { path: String },
    List,
    Reload,
    Exit,
}

impl Command {
    /// Parse one console line
    ///
    /// Blank lines give `Ok(None)`. Wrong arity or an unknown verb gives the
    /// usage text to show the operator.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some(verb) = args.first() else {
            return Ok(None);
        };

        let command = match *verb {
            "add" => {
                if args.len() != 4 {
                    return Err("Usage: add <name> <path> <url>".to_string());
                }
                Command::Add {
                    name: args[1].to_string(),
                    path: args[2].to_string(),
                    url: args[3].to_string(),
                }
            }
            "remove" => {
                if args.len() != 2 {
                    return Err("Usage: remove <path>".to_string());
                }
                Command::Remove {
                    path: args[1].to_string(),
                }
            }
            "list" => Command::List,
            "reload" => Command::Reload,
            "exit" => Command::Exit,
            _ => {
                return Err(
                    "Unknown command. Available commands: add, remove, list, reload, exit".to_string(),
                )
            }
        };

        Ok(Some(command))
    }
}

/// Console bound to a route table and, optionally, a certificate store
#[derive(Debug, Clone)]
pub struct Console {
    table: Arc<RouteTable>,
    certificates: Option<Arc<CertificateStore>>,
}

impl Console {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self {
            table,
            certificates: None,
        }
    }

    /// Enable the `reload` command
    pub fn with_certificates(mut self, certificates: Arc<CertificateStore>) -> Self {
        self.certificates = Some(certificates);
        self
    }

    /// Run the console on its own OS thread
    ///
    /// Reads from a terminal block and cannot be cancelled, so they stay off
    /// the async runtime; shutting the runtime down never waits on input.
    pub fn spawn<R, W>(self, reader: R, writer: W) -> io::Result<thread::JoinHandle<io::Result<()>>>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        thread::Builder::new()
            .name("console".to_string())
            .spawn(move || {
                let result = self.run(reader, writer);
                if let Err(e) = &result {
                    warn!("Console stopped: {}", e);
                }
                info!("Console closed, proxy keeps serving");
                result
            })
    }

    /// Read commands until `exit` or end of input
    pub fn run<R, W>(&self, reader: R, mut writer: W) -> io::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        writer.write_all(BANNER.as_bytes())?;
        let mut lines = reader.lines();

        loop {
            writer.write_all(PROMPT.as_bytes())?;
            writer.flush()?;

            let Some(line) = lines.next().transpose()? else {
                break;
            };

            let output = match Command::parse(&line) {
                Ok(None) => continue,
                Ok(Some(Command::Exit)) => break,
                Ok(Some(command)) => self.execute(command),
                Err(usage) => usage,
            };

            writer.write_all(output.as_bytes())?;
            writer.write_all(b"\n")?;
        }

        writer.flush()
    }

    /// Apply a command and return the text to show
    pub fn execute(&self, command: Command) -> String {
        match command {
            Command::Add { name, path, url } => match self.table.add(&name, &path, &url) {
                Ok(()) => format!("Added service {} at path {}", name, path),
                Err(e) => {
                    warn!(name = %name, path = %path, "console add rejected: {}", e);
                    format!("Error adding service: {}", e)
                }
            },
            Command::Remove { path } => {
                if self.table.deregister(&path) {
                    format!("Removed service at path {}", path)
                } else {
                    format!("No service found at path {}", path)
                }
            }
            Command::List => self.render_list(),
            Command::Reload => match &self.certificates {
                Some(store) => match store.reload() {
                    Ok(hostname) => format!("Reloaded certificate for {}", hostname),
                    Err(e) => format!("Error reloading certificate: {}", e),
                },
                None => "Certificate reload not available".to_string(),
            },
            Command::Exit => String::new(),
        }
    }

    fn render_list(&self) -> String {
        let mut backends = self.table.list();
        backends.sort_by(|a, b| a.path_prefix().cmp(b.path_prefix()));

        let mut out = String::from("===== Services ========================\n");
        for backend in &backends {
            match serde_json::to_string(backend.as_ref()) {
                Ok(json) => {
                    out.push_str(&json);
                    out.push('\n');
                }
                Err(e) => warn!(path = backend.path_prefix(), "failed to render service: {}", e),
            }
        }
        out.push_str("=======================================");
        out
    }
}
