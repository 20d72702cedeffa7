//! Browser process supervision: executable resolution, launch, teardown.
//!
//! None of this is protocol logic; the engine only ever sees the WebSocket
//! URL a launched browser exposes and the handle's alive/kill surface.

use std::env;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info};
use which::which;

use crate::error::SessionError;

const DEFAULT_ARGS: &[&str] = &[
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-breakpad",
    "--disable-client-side-phishing-detection",
    "--disable-component-update",
    "--disable-default-apps",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-hang-monitor",
    "--disable-popup-blocking",
    "--disable-prompt-on-repost",
    "--disable-sync",
    "--metrics-recording-only",
    "--no-first-run",
    "--no-default-browser-check",
    "--password-store=basic",
    "--remote-allow-origins=*",
    "--use-mock-keychain",
];

/// Options controlling how the browser is spawned.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// Explicit executable; falls back to [`detect_executable`] when unset.
    pub executable: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    pub headless: bool,
    /// Zero picks a free port.
    pub remote_debugging_port: u16,
    pub extra_args: Vec<String>,
    pub launch_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            user_data_dir: None,
            headless: resolve_headless_default(),
            remote_debugging_port: 0,
            extra_args: Vec::new(),
            launch_timeout: Duration::from_secs(20),
        }
    }
}

fn resolve_headless_default() -> bool {
    // CDP_HEADLESS: "0", "false", "no", "off" means headful.
    match env::var("CDP_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            !matches!(lower.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

/// A spawned browser plus the DevTools endpoint it exposed.
#[derive(Debug)]
pub struct BrowserHandle {
    child: Child,
    pub ws_url: String,
    pub port: u16,
}

impl BrowserHandle {
    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Forcibly terminate the process and wait for it to exit.
    pub async fn kill(&mut self) -> Result<(), SessionError> {
        self.child.kill().await.map_err(|err| SessionError::Launch {
            reason: format!("kill: {err}"),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        if let Err(err) = self.child.start_kill() {
            if err.kind() != std::io::ErrorKind::InvalidInput {
                debug!(target: "cdp-launcher", ?err, "failed to kill browser on drop");
            }
        }
    }
}

/// Resolve the browser executable: `CDP_CHROME` override, then `$PATH`
/// probing, then OS-specific install locations (skippable with
/// `CDP_SKIP_OS_PATHS` for hermetic tests).
pub fn detect_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("CDP_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("CDP_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    if !skip_defaults {
        for candidate in os_specific_paths() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for root in windows_search_roots() {
            paths.push(root.join("Google/Chrome/Application/chrome.exe"));
            paths.push(root.join("Chromium/Application/chrome.exe"));
            paths.push(root.join("Microsoft/Edge/Application/msedge.exe"));
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}

#[cfg(target_os = "windows")]
fn windows_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                roots.push(PathBuf::from(trimmed));
            }
        }
    }
    roots
}

/// Spawn a browser with remote debugging enabled and wait for it to announce
/// its DevTools WebSocket URL.
pub async fn launch(opts: LaunchOptions) -> Result<BrowserHandle, SessionError> {
    let executable = match &opts.executable {
        Some(path) => {
            if !path.exists() {
                return Err(SessionError::Launch {
                    reason: format!("browser executable not found at {}", path.display()),
                });
            }
            path.clone()
        }
        None => detect_executable().ok_or_else(|| SessionError::Launch {
            reason: "no chrome/chromium executable found; set CDP_CHROME or pass an explicit path"
                .into(),
        })?,
    };

    let port = if opts.remote_debugging_port != 0 {
        opts.remote_debugging_port
    } else {
        pick_free_port()?
    };

    let mut command = Command::new(&executable);
    command
        .arg(format!("--remote-debugging-port={port}"))
        .args(DEFAULT_ARGS)
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    if opts.headless {
        command.args(["--headless=new", "--hide-scrollbars", "--mute-audio"]);
    }
    if let Some(dir) = &opts.user_data_dir {
        command.arg(format!("--user-data-dir={}", dir.display()));
    }
    for arg in &opts.extra_args {
        command.arg(arg);
    }
    command.arg("about:blank");

    let mut child = command.spawn().map_err(|err| SessionError::Launch {
        reason: format!("spawn {}: {err}", executable.display()),
    })?;

    let ws_url = match extract_ws_url(&mut child, opts.launch_timeout).await {
        Ok(url) => url,
        Err(err) => {
            let _ = child.start_kill();
            return Err(err);
        }
    };

    info!(target: "cdp-launcher", url = %ws_url, port, "browser ready");
    Ok(BrowserHandle {
        child,
        ws_url,
        port,
    })
}

fn pick_free_port() -> Result<u16, SessionError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(|err| SessionError::Launch {
        reason: format!("bind: {err}"),
    })?;
    let port = listener
        .local_addr()
        .map_err(|err| SessionError::Launch {
            reason: format!("local_addr: {err}"),
        })?
        .port();
    Ok(port)
}

/// Scrape the DevTools WebSocket URL from the browser's stderr banner.
async fn extract_ws_url(child: &mut Child, deadline: Duration) -> Result<String, SessionError> {
    let stderr = child.stderr.take().ok_or_else(|| SessionError::Launch {
        reason: "browser process missing stderr handle".into(),
    })?;
    let mut lines = BufReader::new(stderr).lines();
    let mut preview = Vec::new();

    let reader = async {
        while let Ok(Some(line)) = lines.next_line().await {
            if preview.len() < 8 {
                preview.push(line.clone());
            }
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") && ws.contains("devtools/browser") {
                    return Ok(ws.to_string());
                }
            }
        }
        Err(SessionError::Launch {
            reason: format!(
                "browser exited before exposing a devtools url. stderr preview: {}",
                preview.join(" | ")
            ),
        })
    };

    match timeout(deadline, reader).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Launch {
            reason: "timed out waiting for the devtools url".into(),
        }),
    }
}
