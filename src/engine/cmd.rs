// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Handles invoking the cluster's administrative binaries.
// This module assumes that, for a given machine, there is only one place
// where the desired executable might be installed. A caller is expected to
// invoke verify_binaries() at start up and to refuse to proceed if it
// returns an error. The binary may still be removed while the process is
// running, so existence is checked again before each invocation and an
// explicit error is returned if the executable can not be found.
//
// Passphrases are never placed on a command line. They travel on stdin or
// in a private key file, and command lines are logged verbatim.

use std::{
    collections::HashMap,
    fmt::Debug,
    path::PathBuf,
    process::Stdio,
    sync::LazyLock,
    time::Duration,
};

use async_trait::async_trait;
use itertools::Itertools;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    engine::context::Context,
    guard::{GuardError, GuardResult},
};

const BINARIES_PATHS: [&str; 4] = ["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

// These are the external binaries that volguard relies on.
// Any change in this list requires a corresponding change to BINARIES,
// and vice-versa.
pub const CEPH: &str = "ceph";
pub const CRYPTSETUP: &str = "cryptsetup";
pub const RADOS: &str = "rados";
pub const RBD: &str = "rbd";

/// Find the binary with the given name by looking in likely locations.
/// Return None if no binary was found.
/// Search an explicit list of directories rather than the user's PATH
/// environment variable, which may not be set for a plugin process.
fn find_binary(name: &str) -> Option<PathBuf> {
    BINARIES_PATHS
        .iter()
        .map(|pre| [pre, name].iter().collect::<PathBuf>())
        .find(|path| path.exists())
}

static BINARIES: LazyLock<HashMap<String, Option<PathBuf>>> = LazyLock::new(|| {
    [CEPH, CRYPTSETUP, RADOS, RBD]
        .iter()
        .map(|name| (name.to_string(), find_binary(name)))
        .collect()
});

/// Verify that all binaries that might be invoked are available at some
/// path. Return an error if any are missing.
pub fn verify_binaries() -> GuardResult<()> {
    let missing: Vec<String> = BINARIES
        .iter()
        .filter(|(_, path)| path.is_none())
        .map(|(name, _)| name.to_owned())
        .sorted()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GuardError::MissingBinaries {
            names: missing,
            locations: BINARIES_PATHS.iter().map(|path| path.to_string()).collect(),
        })
    }
}

/// Get an absolute path for the executable with the given name.
fn get_executable(name: &str) -> GuardResult<PathBuf> {
    let found = match BINARIES.get(name) {
        Some(path) => path.clone(),
        None => find_binary(name),
    };
    match found {
        Some(path) if path.exists() => Ok(path),
        _ => Err(GuardError::MissingBinaries {
            names: vec![name.to_string()],
            locations: BINARIES_PATHS.iter().map(|path| path.to_string()).collect(),
        }),
    }
}

/// Captured output of a command that exited successfully.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes administrative commands against the cluster.
///
/// A command that runs but exits unsuccessfully yields
/// `GuardError::CommandFailed` carrying its stderr. Implementations must
/// honor both `timeout` and the caller's context.
#[async_trait]
pub trait CommandGateway: Debug + Send + Sync {
    async fn execute(
        &self,
        ctx: &Context,
        timeout: Duration,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> GuardResult<CommandOutput>;
}

/// Format a command line for logs and error messages.
pub fn display_cmd(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Gateway that runs real processes.
#[derive(Debug, Default)]
pub struct ProcessGateway;

#[async_trait]
impl CommandGateway for ProcessGateway {
    async fn execute(
        &self,
        ctx: &Context,
        timeout: Duration,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> GuardResult<CommandOutput> {
        let cmd_str = display_cmd(program, args);
        let executable = get_executable(program)?;

        let mut cmd = Command::new(executable);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!("Executing {cmd_str}");
        let output = ctx
            .run(async {
                let mut child = cmd.spawn()?;
                let completed = tokio::time::timeout(timeout, async {
                    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                        pipe.write_all(input).await?;
                        pipe.shutdown().await?;
                    }
                    child.wait_with_output().await
                })
                .await;
                match completed {
                    Ok(res) => Ok(res?),
                    Err(_) => Err(GuardError::Chained(
                        format!("Command {cmd_str} did not complete within {timeout:?}"),
                        Box::new(GuardError::DeadlineExceeded),
                    )),
                }
            })
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr,
            })
        } else {
            Err(GuardError::CommandFailed {
                cmd: cmd_str,
                status: output.status.code(),
                stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_cmd() {
        assert_eq!(
            display_cmd(CEPH, &["osd".to_string(), "blocklist".to_string()]),
            "ceph osd blocklist"
        );
        assert_eq!(display_cmd(RBD, &[]), "rbd");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let res = ProcessGateway
            .execute(
                &Context::background(),
                Duration::from_secs(1),
                "volguard-no-such-binary",
                &[],
                None,
            )
            .await;
        assert_matches!(res, Err(GuardError::MissingBinaries { .. }));
    }
}
