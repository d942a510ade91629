//! Utility for reading and writing sysctl variables.

use std::io;
use std::path::{Path, PathBuf};

/// Operations on `/proc/sys` kernel variables.
pub struct SysCtl;

impl SysCtl {
    const ROOT_PATH: &'static str = "/proc/sys";
    const CMD: &'static str = "sysctl";
    const SUDO: &'static str = "sudo";

    fn variable_path(variable: &str) -> PathBuf {
        Path::new(Self::ROOT_PATH).join(variable.replace('.', "/"))
    }

    /// Read a sysctl variable's value, trimmed.
    pub fn get(variable: &str) -> io::Result<String> {
        if !Self::is_variable(variable) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such sysctl variable: {variable}"),
            ));
        }
        Ok(std::fs::read_to_string(Self::variable_path(variable))?
            .trim()
            .to_string())
    }

    /// Set a sysctl variable. The write goes through the `sysctl` command,
    /// prefixed with sudo when the process is not already root. Returns
    /// whether the command succeeded.
    pub async fn set(variable: &str, value: &str) -> io::Result<bool> {
        let assignment = format!("{variable}={value}");
        let mut command = if nix::unistd::geteuid().is_root() {
            tokio::process::Command::new(Self::CMD)
        } else {
            let mut sudo = tokio::process::Command::new(Self::SUDO);
            sudo.arg(Self::CMD);
            sudo
        };
        let output = command
            .arg("-w")
            .arg(assignment)
            .output()
            .await?;
        Ok(output.status.success())
    }

    /// Whether `variable` names a real sysctl variable on this host.
    pub fn is_variable(variable: &str) -> bool {
        Self::variable_path(variable).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_names_map_to_proc_paths() {
        assert_eq!(
            SysCtl::variable_path("net.ipv4.icmp_echo_ignore_all"),
            PathBuf::from("/proc/sys/net/ipv4/icmp_echo_ignore_all")
        );
    }

    #[test]
    fn unknown_variable_is_not_found() {
        assert!(!SysCtl::is_variable("ychaos.not.a.real.variable"));
        assert!(SysCtl::get("ychaos.not.a.real.variable").is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn a_well_known_variable_reads_back() {
        if SysCtl::is_variable("kernel.ostype") {
            assert_eq!(SysCtl::get("kernel.ostype").expect("read"), "Linux");
        }
    }
}
