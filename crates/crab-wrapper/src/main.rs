//! `crabsh` — the job wrapper cron invokes in place of the real command.
//!
//! It reports START to the daemon, runs the command under a shell with
//! output captured, then reports FINISH with the exit status and output.
//! The daemon must never make a job less reliable: when it is unreachable
//! the command still runs and the wrapper still exits with the command's
//! status. Diagnostics go to stderr with a `crabsh:` prefix so they end up
//! in cron's mail rather than the job's captured output.
//!
//! Environment contract (also recognised as leading `VAR=value` words in
//! the command itself): `CRABID`, `CRABSHELL`, `CRABPIDFILE`, `CRABIGNORE`
//! (truthy: bypass reporting entirely), `CRABECHO` (truthy: echo captured
//! output).

use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crab_core::config::REQUEST_TIMEOUT_SECS;
use crab_core::text::{decode_output, is_truthy, split_embedded_vars};
use crab_core::CrabConfig;

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    inhibit: bool,
}

/// Everything the wrapper reads from its environment.
#[derive(Debug, Clone)]
struct WrapperEnv {
    crabid: Option<String>,
    shell: String,
    pidfile: Option<String>,
    ignore: bool,
    echo: bool,
}

fn main() {
    let code = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map(|rt| rt.block_on(run()))
        .unwrap_or_else(|e| {
            eprintln!("crabsh: cannot start runtime: {e}");
            1
        });
    std::process::exit(code);
}

async fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: crabsh command [args...]");
        return 1;
    }

    let raw_command = args.join(" ");
    let (vars, command) = split_embedded_vars(&raw_command);
    if command.is_empty() {
        eprintln!("crabsh: no command after variable assignments");
        return 1;
    }
    let env = wrapper_env(&vars, |name| std::env::var(name).ok());

    // CRABIGNORE: run the command untouched, report nothing.
    if env.ignore {
        return exec_unreported(&env, &command, &vars).await;
    }

    let config = CrabConfig::load(None).unwrap_or_else(|e| {
        eprintln!("crabsh: config unavailable ({e}); reporting disabled");
        CrabConfig {
            crab: Default::default(),
            store: crab_core::config::StoreSection {
                path: String::new(),
                retention_days: None,
            },
            outputstore: None,
            notify: Default::default(),
            transport: Default::default(),
            crabsh: Default::default(),
        }
    });
    let reporter = Reporter::new(&config, &env, &command);

    // PID-file discipline: one copy of the job at a time. The file carries
    // our own PID, written before the child spawns.
    if let Some(pidfile) = &env.pidfile {
        match check_pidfile(pidfile) {
            PidCheck::Busy(pid) => {
                eprintln!("crabsh: already running (pid {pid}), skipping");
                reporter.finish(json!({"kind": "alreadyrunning"})).await;
                return 0;
            }
            PidCheck::Free => {
                if let Err(e) = std::fs::write(pidfile, format!("{}\n", std::process::id())) {
                    eprintln!("crabsh: cannot write pid file {pidfile}: {e}");
                }
            }
        }
    }
    let _pid_guard = env.pidfile.as_deref().map(PidGuard);

    // START; the response may ask us to skip an inhibited job.
    if let Some(start) = reporter.start().await {
        if start.inhibit && config.crabsh.allow_inhibit {
            eprintln!("crabsh: job inhibited, skipping");
            reporter.finish(json!({"kind": "inhibited"})).await;
            return 0;
        }
    }

    // Run the command under the shell, capturing output as raw bytes.
    let output = tokio::process::Command::new(&env.shell)
        .arg("-c")
        .arg(&command)
        .envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            eprintln!("crabsh: could not start {command:?}: {e}");
            reporter
                .finish(json!({"kind": "couldnotstart", "stderr": e.to_string()}))
                .await;
            return 1;
        }
    };

    let stdout = decode_output(&output.stdout);
    let stderr = decode_output(&output.stderr);
    if env.echo {
        print!("{stdout}");
        let _ = std::io::stderr().write_all(stderr.as_bytes());
    }

    let status = exit_code(&output.status);
    reporter
        .finish(json!({
            "status": status,
            "stdout": stdout,
            "stderr": stderr,
        }))
        .await;
    status
}

/// Resolve the wrapper environment: embedded `VAR=value` words override
/// the process environment.
fn wrapper_env(
    vars: &[(String, String)],
    lookup: impl Fn(&str) -> Option<String>,
) -> WrapperEnv {
    let get = |name: &str| {
        vars.iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .or_else(|| lookup(name))
    };
    WrapperEnv {
        crabid: get("CRABID").filter(|s| !s.is_empty()),
        shell: get("CRABSHELL").unwrap_or_else(|| "/bin/sh".to_string()),
        pidfile: get("CRABPIDFILE").filter(|s| !s.is_empty()),
        ignore: get("CRABIGNORE").as_deref().map(is_truthy).unwrap_or(false),
        echo: get("CRABECHO").as_deref().map(is_truthy).unwrap_or(false),
    }
}

/// Run the command with inherited stdio and no reporting (CRABIGNORE).
async fn exec_unreported(env: &WrapperEnv, command: &str, vars: &[(String, String)]) -> i32 {
    let status = tokio::process::Command::new(&env.shell)
        .arg("-c")
        .arg(command)
        .envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .status()
        .await;
    match status {
        Ok(status) => exit_code(&status),
        Err(e) => {
            eprintln!("crabsh: could not start {command:?}: {e}");
            1
        }
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

enum PidCheck {
    Busy(u32),
    Free,
}

fn check_pidfile(path: &str) -> PidCheck {
    match std::fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(pid) if Path::new(&format!("/proc/{pid}")).exists() => PidCheck::Busy(pid),
            _ => PidCheck::Free,
        },
        Err(_) => PidCheck::Free,
    }
}

/// Removes the wrapper PID file on every exit path.
struct PidGuard<'a>(&'a str);

impl Drop for PidGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}

/// Best-effort lifecycle reporting to the daemon.
struct Reporter {
    client: Option<reqwest::Client>,
    base: Option<String>,
    host: String,
    crabid: Option<String>,
    command: String,
}

impl Reporter {
    fn new(config: &CrabConfig, env: &WrapperEnv, command: &str) -> Self {
        let base = config.base_url().or_else(|| {
            Some(format!(
                "http://{}:{}",
                config.crab.bind, config.crab.port
            ))
        });
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| eprintln!("crabsh: http client unavailable: {e}"))
            .ok();
        Reporter {
            client,
            base,
            host: hostname(),
            crabid: env.crabid.clone(),
            command: command.to_string(),
        }
    }

    fn url(&self, action: &str) -> Option<String> {
        let base = self.base.as_deref()?;
        Some(match &self.crabid {
            Some(crabid) => format!("{base}/api/0/crab/{}/{}/{}", self.host, crabid, action),
            None => format!("{base}/api/0/crab/{}/{}", self.host, action),
        })
    }

    async fn start(&self) -> Option<StartResponse> {
        let url = self.url("start")?;
        let client = self.client.as_ref()?;
        let body = json!({"command": self.command});
        match client.put(&url).json(&body).send().await {
            Ok(response) => response
                .json::<StartResponse>()
                .await
                .map_err(|e| eprintln!("crabsh: bad start response: {e}"))
                .ok(),
            Err(e) => {
                eprintln!("crabsh: could not report start: {e}");
                None
            }
        }
    }

    async fn finish(&self, mut body: serde_json::Value) {
        let Some(url) = self.url("finish") else {
            return;
        };
        let Some(client) = self.client.as_ref() else {
            return;
        };
        body["command"] = json!(self.command);
        if let Err(e) = client.put(&url).json(&body).send().await {
            eprintln!("crabsh: could not report finish: {e}");
        }
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}
