//! Environment gathering for the system prompt.
//!
//! Tells the model which machine the coordinator (or local session) runs on,
//! so paths and commands fit the host.

use std::path::PathBuf;

/// Facts about the host the local tools run on.
#[derive(Debug, Clone)]
pub struct Environment {
    pub cwd: PathBuf,
    pub shell: String,
    pub os: String,
}

/// Gather the environment of this process.
pub fn gather() -> Environment {
    Environment {
        cwd: get_cwd(),
        shell: get_shell(),
        os: get_os_info(),
    }
}

fn get_cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn get_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn get_os_info() -> String {
    let base = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);

    #[cfg(target_os = "linux")]
    {
        if let Ok(contents) = std::fs::read_to_string("/etc/os-release") {
            for line in contents.lines() {
                if let Some(pretty_name) = line.strip_prefix("PRETTY_NAME=") {
                    return format!("{} ({})", base, pretty_name.trim_matches('"'));
                }
            }
        }
    }

    base
}
