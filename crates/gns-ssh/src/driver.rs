//! Vendor-neutral SSH device driver.
//!
//! Wraps a blocking ssh2 shell channel with the conventions network devices
//! expect: a pty, prompt discovery, per-platform paging disable, command
//! echo stripping. The driver is synchronous by design — the session manager
//! confines every call to `spawn_blocking`.

use std::io::Read;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use gns_proto::DeviceSpec;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ─── Failure classification ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshFailureKind {
    AuthenticationFailed,
    ConnectionRefused,
    Timeout,
    HostUnreachable,
}

impl SshFailureKind {
    /// What the operator should do about it.
    pub fn suggested_action(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => {
                "verify the username/password, or enable SSH on the device \
                 through its console first"
            }
            Self::ConnectionRefused => {
                "check that SSH is enabled on the device and the port is correct"
            }
            Self::Timeout => "the device is slow or filtered; raise the timeout or check reachability",
            Self::HostUnreachable => "verify the address and that the node is started",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::ConnectionRefused => "connection_refused",
            Self::Timeout => "timeout",
            Self::HostUnreachable => "host_unreachable",
        }
    }
}

/// A classified connection failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("SSH connect to {host}:{port} failed ({}): {message}", kind.as_str())]
pub struct SshFailure {
    pub kind: SshFailureKind,
    pub host: String,
    pub port: u16,
    pub message: String,
}

fn classify_io(e: &std::io::Error) -> SshFailureKind {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused => SshFailureKind::ConnectionRefused,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => SshFailureKind::Timeout,
        _ => SshFailureKind::HostUnreachable,
    }
}

// ─── Device profiles ──────────────────────────────────────────────────────────

/// Per-platform conventions. Unknown device types fall back to a permissive
/// prompt and no paging command.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Matches the prompt at the end of output.
    pub prompt_pattern: &'static str,
    pub paging_disable: Option<&'static str>,
    pub config_enter: Option<&'static str>,
    pub config_exit: Option<&'static str>,
}

pub fn profile_for(device_type: &str) -> DeviceProfile {
    match device_type {
        "cisco_ios" | "cisco_xe" | "cisco_nxos" => DeviceProfile {
            prompt_pattern: r"[\w.\-()/]+[>#]\s*$",
            paging_disable: Some("terminal length 0"),
            config_enter: Some("configure terminal"),
            config_exit: Some("end"),
        },
        "cisco_asa" => DeviceProfile {
            prompt_pattern: r"[\w.\-()/]+[>#]\s*$",
            paging_disable: Some("terminal pager 0"),
            config_enter: Some("configure terminal"),
            config_exit: Some("end"),
        },
        "arista_eos" => DeviceProfile {
            prompt_pattern: r"[\w.\-()/]+[>#]\s*$",
            paging_disable: Some("terminal length 0"),
            config_enter: Some("configure"),
            config_exit: Some("end"),
        },
        "juniper" | "juniper_junos" => DeviceProfile {
            prompt_pattern: r"[\w.\-@]+[>#%]\s*$",
            paging_disable: Some("set cli screen-length 0"),
            config_enter: Some("configure"),
            config_exit: Some("exit configuration-mode"),
        },
        "huawei" | "huawei_vrp" => DeviceProfile {
            prompt_pattern: r"[<\[][\w.\-]+[>\]]\s*$",
            paging_disable: Some("screen-length 0 temporary"),
            config_enter: Some("system-view"),
            config_exit: Some("return"),
        },
        "mikrotik_routeros" => DeviceProfile {
            prompt_pattern: r"\[[\w@.\-/ ]+\]\s*>\s*$",
            paging_disable: None,
            config_enter: None,
            config_exit: None,
        },
        "linux" | "alpine" => DeviceProfile {
            prompt_pattern: r"[\$#]\s*$",
            paging_disable: None,
            config_enter: None,
            config_exit: None,
        },
        _ => DeviceProfile {
            prompt_pattern: r"[>#\$%\]]\s*$",
            paging_disable: None,
            config_enter: None,
            config_exit: None,
        },
    }
}

// ─── Driver errors ────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("command did not complete in time")]
    Timeout { partial: String },

    #[error("channel closed by peer")]
    Eof { partial: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
}

// ─── Driver ───────────────────────────────────────────────────────────────────

/// How long a single blocking channel read may stall before the driver
/// re-checks its deadline.
const READ_SLICE: Duration = Duration::from_millis(500);

pub struct SshDriver {
    session: ssh2::Session,
    channel: ssh2::Channel,
    prompt_re: Regex,
    profile: DeviceProfile,
}

impl std::fmt::Debug for SshDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshDriver")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl SshDriver {
    /// Dial, authenticate, open a shell, discover the prompt, and disable
    /// paging. Connection failures come back classified.
    pub fn connect(spec: &DeviceSpec, connect_timeout: Duration) -> Result<Self, SshFailure> {
        let fail = |kind: SshFailureKind, message: String| SshFailure {
            kind,
            host: spec.host.clone(),
            port: spec.port,
            message,
        };

        let addr = format!("{}:{}", spec.host, spec.port)
            .to_socket_addrs()
            .map_err(|e| fail(SshFailureKind::HostUnreachable, e.to_string()))?
            .next()
            .ok_or_else(|| {
                fail(
                    SshFailureKind::HostUnreachable,
                    "address resolved to nothing".to_string(),
                )
            })?;

        let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| fail(classify_io(&e), e.to_string()))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| fail(SshFailureKind::HostUnreachable, e.to_string()))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| fail(SshFailureKind::ConnectionRefused, e.to_string()))?;

        let auth = match &spec.key_file {
            Some(key_file) => session.userauth_pubkey_file(
                &spec.username,
                None,
                Path::new(key_file),
                None,
            ),
            None => session.userauth_password(&spec.username, &spec.password),
        };
        auth.map_err(|e| fail(SshFailureKind::AuthenticationFailed, e.to_string()))?;
        if !session.authenticated() {
            return Err(fail(
                SshFailureKind::AuthenticationFailed,
                "authentication did not complete".to_string(),
            ));
        }

        session.set_timeout(READ_SLICE.as_millis() as u32);
        let mut channel = session
            .channel_session()
            .map_err(|e| fail(SshFailureKind::ConnectionRefused, e.to_string()))?;
        channel
            .request_pty("vt100", None, Some((120, 40, 0, 0)))
            .map_err(|e| fail(SshFailureKind::ConnectionRefused, e.to_string()))?;
        channel
            .shell()
            .map_err(|e| fail(SshFailureKind::ConnectionRefused, e.to_string()))?;

        let profile = profile_for(&spec.device_type);
        let prompt_re = Regex::new(profile.prompt_pattern).expect("profile patterns are valid");

        let mut driver = Self {
            session,
            channel,
            prompt_re,
            profile,
        };
        driver
            .initialize(spec)
            .map_err(|e| fail(SshFailureKind::Timeout, e.to_string()))?;
        info!(
            host = %spec.host,
            port = spec.port,
            device_type = %spec.device_type,
            "ssh driver connected"
        );
        Ok(driver)
    }

    fn initialize(&mut self, spec: &DeviceSpec) -> Result<(), DriverError> {
        let settle = spec
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        // Nudge the device and wait for the first prompt.
        self.write_line("")?;
        let banner = self.read_until_prompt(Instant::now() + settle)?;
        debug!(banner_len = banner.len(), "prompt discovered");

        if let Some(cmd) = self.profile.paging_disable {
            self.write_line(cmd)?;
            let _ = self.read_until_prompt(Instant::now() + settle)?;
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), DriverError> {
        self.channel.write_all(line.as_bytes())?;
        self.channel.write_all(b"\n")?;
        self.channel.flush()?;
        Ok(())
    }

    /// Read until `stop` matches the normalized output or the deadline
    /// passes. Returns the normalized output including the match.
    fn read_until(&mut self, stop: &Regex, deadline: Instant) -> Result<String, DriverError> {
        let mut out = String::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.channel.read(&mut buf) {
                Ok(0) => {
                    return Err(DriverError::Eof {
                        partial: normalize(&out),
                    });
                }
                Ok(n) => {
                    out.push_str(&String::from_utf8_lossy(&buf[..n]));
                    let cleaned = normalize(&out);
                    if stop.is_match(&cleaned) {
                        return Ok(cleaned);
                    }
                }
                Err(e) if is_poll_timeout(&e) => {}
                Err(e) => return Err(DriverError::Io(e)),
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    partial: normalize(&out),
                });
            }
        }
    }

    fn read_until_prompt(&mut self, deadline: Instant) -> Result<String, DriverError> {
        let prompt = self.prompt_re.clone();
        self.read_until(&prompt, deadline)
    }

    /// Execute one command, waiting for `expect` (or the prompt) for at most
    /// `read_timeout`. The echo and trailing prompt are stripped.
    pub fn send_command(
        &mut self,
        command: &str,
        expect: Option<&Regex>,
        read_timeout: Duration,
    ) -> Result<String, DriverError> {
        self.write_line(command)?;
        let deadline = Instant::now() + read_timeout;
        let raw = match expect {
            Some(re) => self.read_until(re, deadline)?,
            None => self.read_until_prompt(deadline)?,
        };
        Ok(strip_echo_and_prompt(&raw, command, &self.prompt_re))
    }

    /// Push a set of configuration lines, entering and leaving the
    /// platform's configuration mode when it has one.
    pub fn send_config_set(
        &mut self,
        commands: &[String],
        read_timeout: Duration,
    ) -> Result<String, DriverError> {
        let mut transcript = String::new();
        if let Some(enter) = self.profile.config_enter {
            transcript.push_str(&self.send_command(enter, None, read_timeout)?);
        }
        for command in commands {
            let out = self.send_command(command, None, read_timeout)?;
            if !out.is_empty() {
                transcript.push_str(&out);
                transcript.push('\n');
            }
        }
        if let Some(exit) = self.profile.config_exit {
            transcript.push_str(&self.send_command(exit, None, read_timeout)?);
        }
        Ok(transcript)
    }

    /// Cheap health check: transport still up and an empty command returns
    /// a prompt.
    pub fn probe(&mut self) -> bool {
        if self.channel.eof() {
            return false;
        }
        if self.write_line("").is_err() {
            return false;
        }
        self.read_until_prompt(Instant::now() + Duration::from_secs(5))
            .is_ok()
    }

    pub fn close(&mut self) {
        let _ = self.channel.close();
        let _ = self.session.disconnect(None, "session closed", None);
    }
}

fn is_poll_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    ) || e
        .to_string()
        .to_ascii_lowercase()
        .contains("timeout")
}

/// Normalize device output: CRLF and bare CR to LF.
fn normalize(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

/// Remove the leading command echo and the trailing prompt line.
fn strip_echo_and_prompt(output: &str, command: &str, prompt_re: &Regex) -> String {
    let mut lines: Vec<&str> = output.lines().collect();

    if let Some(first) = lines.first() {
        if first.trim_end() == command || first.trim_end().ends_with(command) {
            lines.remove(0);
        }
    }
    while let Some(last) = lines.last() {
        let trimmed = last.trim_end();
        if trimmed.is_empty() || prompt_re.is_match(trimmed) {
            lines.pop();
        } else {
            break;
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_have_valid_prompt_patterns() {
        for device in [
            "cisco_ios",
            "cisco_asa",
            "arista_eos",
            "juniper_junos",
            "huawei",
            "mikrotik_routeros",
            "linux",
            "totally_unknown",
        ] {
            let profile = profile_for(device);
            Regex::new(profile.prompt_pattern).expect("valid pattern");
        }
    }

    #[test]
    fn test_cisco_profile_paging_and_config() {
        let p = profile_for("cisco_ios");
        assert_eq!(p.paging_disable, Some("terminal length 0"));
        assert_eq!(p.config_enter, Some("configure terminal"));
        assert_eq!(p.config_exit, Some("end"));
    }

    #[test]
    fn test_linux_profile_has_no_paging() {
        let p = profile_for("linux");
        assert!(p.paging_disable.is_none());
        assert!(p.config_enter.is_none());
    }

    #[test]
    fn test_prompt_patterns_match_typical_prompts() {
        let cases = [
            ("cisco_ios", "R1#"),
            ("cisco_ios", "R1>"),
            ("cisco_ios", "R1(config)#"),
            ("juniper_junos", "admin@fw0>"),
            ("huawei", "<CE1>"),
            ("mikrotik_routeros", "[admin@MikroTik] >"),
            ("linux", "alpine:~# "),
        ];
        for (device, prompt) in cases {
            let re = Regex::new(profile_for(device).prompt_pattern).expect("pattern");
            assert!(re.is_match(prompt), "{device} prompt '{prompt}' must match");
        }
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_strip_echo_and_prompt() {
        let prompt = Regex::new(profile_for("cisco_ios").prompt_pattern).expect("pattern");
        let raw = "show ip int brief\nInterface  IP-Address  Status\nGi0/0  10.0.0.1  up\nR1#";
        let out = strip_echo_and_prompt(raw, "show ip int brief", &prompt);
        assert_eq!(out, "Interface  IP-Address  Status\nGi0/0  10.0.0.1  up");
    }

    #[test]
    fn test_strip_keeps_body_without_echo() {
        let prompt = Regex::new(r"[\$#]\s*$").expect("pattern");
        let raw = "uptime output line\nalpine:~# ";
        let out = strip_echo_and_prompt(raw, "uptime", &prompt);
        assert_eq!(out, "uptime output line");
    }

    #[test]
    fn test_failure_kinds_have_actions() {
        for kind in [
            SshFailureKind::AuthenticationFailed,
            SshFailureKind::ConnectionRefused,
            SshFailureKind::Timeout,
            SshFailureKind::HostUnreachable,
        ] {
            assert!(!kind.suggested_action().is_empty());
            assert!(!kind.as_str().is_empty());
        }
    }

    #[test]
    fn test_classify_io_kinds() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            classify_io(&Error::new(ErrorKind::ConnectionRefused, "refused")),
            SshFailureKind::ConnectionRefused
        );
        assert_eq!(
            classify_io(&Error::new(ErrorKind::TimedOut, "slow")),
            SshFailureKind::Timeout
        );
        assert_eq!(
            classify_io(&Error::new(ErrorKind::NetworkUnreachable, "no route")),
            SshFailureKind::HostUnreachable
        );
    }

    #[test]
    fn test_connect_refused_is_classified() {
        let spec = DeviceSpec {
            device_type: "linux".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "root".to_string(),
            password: "root".to_string(),
            secret: None,
            key_file: None,
            timeout: Some(1),
        };
        let err = SshDriver::connect(&spec, Duration::from_millis(500)).expect_err("refused");
        assert_eq!(err.kind, SshFailureKind::ConnectionRefused);
    }
}
