use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use reqwest::Url;

use parget::progress::ProgressMode;
use parget::transfer::auth::Credentials;
use parget::transfer::{TransferError, TransferRequest, DEFAULT_CONCURRENT};
use parget::util::{parse_speed_limit, unit_pair_to_bytes};

#[derive(Parser, Debug, Clone)]
#[command(name = "parget", author, version, about = "Multi-part file-transfer accelerator", long_about = None)]
pub struct Cli {
    /// Number of simultaneous connections per file
    #[arg(short = 'p', long, value_name = "int", default_value_t = 4)]
    pub parts: u32,

    /// Aggregate speed limit per second, e.g. 500KiB or 2.5MiBps
    #[arg(short = 'l', long, value_name = "rate")]
    pub limit: Option<String>,

    /// Seconds to wait on a disconnection before giving up
    #[arg(short = 't', long, value_name = "secs", default_value_t = 20)]
    pub timeout: u64,

    /// Disable progress updates
    #[arg(short = 's', long, action = ArgAction::SetTrue)]
    pub silent: bool,

    /// Start transfers anew
    #[arg(long, action = ArgAction::SetTrue)]
    pub restart: bool,

    /// Stream progress as newline-delimited JSON
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Verbose logging
    #[arg(short = 'v', long, action = ArgAction::SetTrue, conflicts_with = "silent")]
    pub verbose: bool,

    #[command(subcommand)]
    pub protocol: Protocol,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Protocol {
    /// Connect via HTTP(S)
    Http(HttpArgs),
    /// Connect via SFTP
    Sftp,
}

#[derive(Args, Debug, Clone)]
pub struct HttpArgs {
    #[arg(long, alias = "un", value_name = "user")]
    pub username: Option<String>,

    /// Prompted for when a username is given without one
    #[arg(long, alias = "pw", value_name = "pass")]
    pub password: Option<String>,

    /// Method of authentication
    #[arg(long, value_enum, default_value = "basic")]
    pub auth: AuthScheme,

    /// Verify TLS certificates (default)
    #[arg(long, overrides_with = "insecure")]
    pub secure: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    #[command(subcommand)]
    pub command: HttpCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum HttpCommand {
    /// Download one or more URLs
    Get {
        /// Remote URL; repeat for multiple files
        #[arg(short = 'u', long = "url", value_name = "url", required = true)]
        urls: Vec<String>,

        /// Local destination file or directory
        #[arg(short = 'p', long, value_name = "path")]
        path: PathBuf,

        /// Reuse one connection pool across transfers (default)
        #[arg(long, overrides_with = "new")]
        persist: bool,

        /// Use a dedicated connection pool per transfer
        #[arg(long = "new")]
        new: bool,

        /// Prefer the server-suggested file name
        #[arg(long, action = ArgAction::SetTrue)]
        keep: bool,
    },
    /// Upload a local file
    Send,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
    Oauth1,
    Kerberos,
    Ntlm,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// A fully resolved run: session parameters plus one request per URL.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub concurrent: usize,
    pub speed_limit: Option<u64>,
    pub progress: ProgressMode,
    pub requests: Vec<TransferRequest>,
}

impl TryFrom<Cli> for Invocation {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let speed_limit = match &cli.limit {
            Some(raw) => {
                let (value, unit) = parse_speed_limit(raw);
                let bytes = unit_pair_to_bytes(value, &unit);
                (bytes > 0).then_some(bytes)
            }
            None => None,
        };

        let progress = if cli.json {
            ProgressMode::Json
        } else if cli.silent {
            ProgressMode::Quiet
        } else {
            ProgressMode::Text
        };

        let Protocol::Http(http) = &cli.protocol else {
            bail!("the sftp transport is not implemented");
        };

        let HttpCommand::Get {
            urls,
            path,
            new,
            keep,
            ..
        } = &http.command
        else {
            bail!("upload via `http send` is not implemented");
        };

        let auth = build_credentials(http)?;

        let mut requests = Vec::with_capacity(urls.len());
        for raw in urls {
            let url = Url::parse(raw).with_context(|| format!("invalid URL: {raw}"))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                bail!("unsupported URL scheme: {}", url.scheme());
            }

            let mut request = TransferRequest::new(url, path.clone());
            request.auth = auth.clone();
            request.verify_tls = !http.insecure;
            request.parts = cli.parts.max(1);
            request.speed_limit = speed_limit;
            request.timeout = Duration::from_secs(cli.timeout);
            request.restart = cli.restart;
            request.keep_remote_name = *keep;
            request.persist_connection = !*new;
            requests.push(request);
        }

        Ok(Invocation {
            concurrent: DEFAULT_CONCURRENT,
            speed_limit,
            progress,
            requests,
        })
    }
}

fn build_credentials(http: &HttpArgs) -> Result<Option<Credentials>> {
    let Some(username) = &http.username else {
        return Ok(None);
    };
    let password = match &http.password {
        Some(password) => password.clone(),
        None => prompt_password(username)?,
    };

    match http.auth {
        AuthScheme::Basic => Ok(Some(Credentials::basic(username, password))),
        AuthScheme::Digest => Ok(Some(Credentials::digest(username, password))),
        other => Err(TransferError::UnsupportedAuth {
            scheme: format!("{other:?}").to_lowercase(),
        }
        .into()),
    }
}

fn prompt_password(username: &str) -> Result<String> {
    eprint!("Please enter password for {username}: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoke(args: &[&str]) -> Result<Invocation> {
        Invocation::try_from(Cli::try_parse_from(args).expect("cli parse"))
    }

    #[test]
    fn progress_mode_defaults_to_text() {
        let inv = invoke(&[
            "parget", "http", "get", "-u", "https://example.test/f", "-p", "out",
        ])
        .unwrap();
        assert_eq!(inv.progress, ProgressMode::Text);
    }

    #[test]
    fn silent_selects_quiet_and_json_wins() {
        let quiet = invoke(&[
            "parget", "--silent", "http", "get", "-u", "https://example.test/f", "-p", "out",
        ])
        .unwrap();
        assert_eq!(quiet.progress, ProgressMode::Quiet);

        let json = invoke(&[
            "parget", "--silent", "--json", "http", "get", "-u", "https://example.test/f", "-p",
            "out",
        ])
        .unwrap();
        assert_eq!(json.progress, ProgressMode::Json);
    }

    #[test]
    fn speed_limit_becomes_bytes_per_second() {
        let inv = invoke(&[
            "parget", "-l", "2KiB", "http", "get", "-u", "https://example.test/f", "-p", "out",
        ])
        .unwrap();
        assert_eq!(inv.speed_limit, Some(2048));
        assert_eq!(inv.requests[0].speed_limit, Some(2048));
    }

    #[test]
    fn unparsable_limit_means_no_limit() {
        let inv = invoke(&[
            "parget", "-l", "fast", "http", "get", "-u", "https://example.test/f", "-p", "out",
        ])
        .unwrap();
        assert_eq!(inv.speed_limit, None);
    }

    #[test]
    fn request_flags_flow_through() {
        let inv = invoke(&[
            "parget",
            "--parts",
            "8",
            "--timeout",
            "7",
            "--restart",
            "http",
            "--insecure",
            "get",
            "-u",
            "https://example.test/a",
            "-u",
            "https://example.test/b",
            "-p",
            "out",
            "--new",
            "--keep",
        ])
        .unwrap();

        assert_eq!(inv.requests.len(), 2);
        let request = &inv.requests[0];
        assert_eq!(request.parts, 8);
        assert_eq!(request.timeout, Duration::from_secs(7));
        assert!(request.restart);
        assert!(!request.verify_tls);
        assert!(!request.persist_connection);
        assert!(request.keep_remote_name);
    }

    #[test]
    fn basic_credentials_are_attached() {
        let inv = invoke(&[
            "parget", "http", "--username", "alice", "--password", "hunter2", "get", "-u",
            "https://example.test/f", "-p", "out",
        ])
        .unwrap();
        assert!(matches!(
            inv.requests[0].auth,
            Some(Credentials::Basic { ref username, .. }) if username == "alice"
        ));
    }

    #[test]
    fn exotic_auth_schemes_are_rejected() {
        let err = invoke(&[
            "parget", "http", "--username", "alice", "--password", "x", "--auth", "ntlm", "get",
            "-u", "https://example.test/f", "-p", "out",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("ntlm"));
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        let err = invoke(&[
            "parget", "http", "get", "-u", "ftp://example.test/f", "-p", "out",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[test]
    fn send_is_not_implemented() {
        let err = invoke(&["parget", "http", "send"]).unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }
}
