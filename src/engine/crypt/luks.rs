// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt::Debug, io::Write, sync::Arc, time::Duration};

use async_trait::async_trait;
use tempfile::Builder;

use crate::{
    engine::{
        cmd::{CommandGateway, CommandOutput, CRYPTSETUP},
        context::Context,
        types::{CreateAction, DeleteAction, KeySlot, SizedKeyMemory},
    },
    guard::{GuardError, GuardResult},
};

/// Exit status of `cryptsetup status` for an inactive mapping.
const STATUS_INACTIVE: i32 = 4;

/// Operations on the LUKS header of a block device. Every operation is
/// bounded by the implementation's timeout as well as by the context.
#[async_trait]
pub trait LuksWrapper: Debug + Send + Sync {
    /// Write a new LUKS2 header whose slot 0 holds `passphrase`.
    async fn format(&self, ctx: &Context, device: &str, passphrase: &SizedKeyMemory)
        -> GuardResult<()>;

    /// Unlock `device` as `/dev/mapper/<mapper_name>`.
    async fn open(
        &self,
        ctx: &Context,
        device: &str,
        mapper_name: &str,
        passphrase: &SizedKeyMemory,
    ) -> GuardResult<()>;

    async fn is_open(&self, ctx: &Context, mapper_name: &str) -> GuardResult<bool>;

    /// Put `new` into `slot`, authenticating with `auth`. A slot that
    /// already holds `new` is left alone; a slot holding anything else is
    /// wiped and refilled.
    async fn add_key(
        &self,
        ctx: &Context,
        device: &str,
        auth: &SizedKeyMemory,
        new: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<CreateAction<KeySlot>>;

    /// Wipe `slot`, authenticating with `auth`. Wiping an inactive slot
    /// succeeds.
    async fn remove_key(
        &self,
        ctx: &Context,
        device: &str,
        auth: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<DeleteAction<KeySlot>>;

    /// Whether `passphrase` opens `slot`.
    async fn verify_key(
        &self,
        ctx: &Context,
        device: &str,
        passphrase: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<bool>;
}

/// `LuksWrapper` on top of the cryptsetup executable. Passphrases go to
/// cryptsetup on stdin; when two are needed, the authenticating one goes in
/// a temporary file readable only by this process.
#[derive(Debug)]
pub struct CryptsetupLuks {
    gateway: Arc<dyn CommandGateway>,
    timeout: Duration,
}

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn failure_stderr(err: &GuardError) -> Option<&str> {
    match err {
        GuardError::CommandFailed { stderr, .. } => Some(stderr),
        _ => None,
    }
}

impl CryptsetupLuks {
    pub fn new(gateway: Arc<dyn CommandGateway>, timeout: Duration) -> CryptsetupLuks {
        CryptsetupLuks { gateway, timeout }
    }

    async fn cryptsetup(
        &self,
        ctx: &Context,
        args: Vec<String>,
        stdin: Option<&SizedKeyMemory>,
    ) -> GuardResult<CommandOutput> {
        self.gateway
            .execute(
                ctx,
                self.timeout,
                CRYPTSETUP,
                &args,
                stdin.map(|p| p.as_ref()),
            )
            .await
    }

    /// One `luksAddKey` invocation, without any recovery.
    async fn add_key_once(
        &self,
        ctx: &Context,
        device: &str,
        auth: &SizedKeyMemory,
        new: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<()> {
        let mut auth_file = Builder::new().prefix("luks-").tempfile()?;
        auth_file.write_all(auth.as_ref())?;
        auth_file.flush()?;

        let args = vec![
            "--verbose".to_string(),
            format!("--key-file={}", auth_file.path().display()),
            format!("--key-slot={slot}"),
            "luksAddKey".to_string(),
            device.to_string(),
            "-d".to_string(),
            "/dev/stdin".to_string(),
        ];
        self.cryptsetup(ctx, args, Some(new)).await?;
        Ok(())
    }
}

#[async_trait]
impl LuksWrapper for CryptsetupLuks {
    async fn format(
        &self,
        ctx: &Context,
        device: &str,
        passphrase: &SizedKeyMemory,
    ) -> GuardResult<()> {
        let args = strings(&[
            "-q",
            "luksFormat",
            "--type",
            "luks2",
            "--hash",
            "sha256",
            device,
            "-d",
            "/dev/stdin",
        ]);
        chain_err!(
            self.cryptsetup(ctx, args, Some(passphrase)).await,
            "Failed to format {} as LUKS2",
            device
        )?;
        info!("Formatted {device} as LUKS2");
        Ok(())
    }

    async fn open(
        &self,
        ctx: &Context,
        device: &str,
        mapper_name: &str,
        passphrase: &SizedKeyMemory,
    ) -> GuardResult<()> {
        let args = strings(&[
            "luksOpen",
            device,
            mapper_name,
            "--disable-keyring",
            "-d",
            "/dev/stdin",
        ]);
        chain_err!(
            self.cryptsetup(ctx, args, Some(passphrase)).await,
            "Failed to open {} as {}",
            device,
            mapper_name
        )?;
        Ok(())
    }

    async fn is_open(&self, ctx: &Context, mapper_name: &str) -> GuardResult<bool> {
        match self
            .cryptsetup(ctx, strings(&["status", mapper_name]), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(GuardError::CommandFailed {
                status: Some(STATUS_INACTIVE),
                ..
            }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn add_key(
        &self,
        ctx: &Context,
        device: &str,
        auth: &SizedKeyMemory,
        new: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<CreateAction<KeySlot>> {
        let err = match self.add_key_once(ctx, device, auth, new, slot).await {
            Ok(()) => return Ok(CreateAction::Created(slot)),
            Err(err) => err,
        };
        let full = format!("Key slot {slot} is full");
        if !failure_stderr(&err).is_some_and(|stderr| stderr.contains(&full)) {
            return Err(err);
        }

        if self.verify_key(ctx, device, new, slot).await? {
            debug!("Key slot {slot} of {device} already holds the new passphrase");
            return Ok(CreateAction::Identity);
        }
        // The new passphrase is not yet known to the header, so the
        // existing one authenticates the wipe.
        self.remove_key(ctx, device, auth, slot).await?;
        self.add_key_once(ctx, device, auth, new, slot).await?;
        Ok(CreateAction::Created(slot))
    }

    async fn remove_key(
        &self,
        ctx: &Context,
        device: &str,
        auth: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<DeleteAction<KeySlot>> {
        let slot_str = slot.to_string();
        let args = strings(&[
            "--verbose",
            "luksKillSlot",
            device,
            &slot_str,
            "-d",
            "/dev/stdin",
        ]);
        match self.cryptsetup(ctx, args, Some(auth)).await {
            Ok(_) => Ok(DeleteAction::Deleted(slot)),
            Err(err) => {
                let inactive = format!("Keyslot {slot} is not active.");
                if failure_stderr(&err).is_some_and(|stderr| stderr.contains(&inactive)) {
                    Ok(DeleteAction::Identity)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn verify_key(
        &self,
        ctx: &Context,
        device: &str,
        passphrase: &SizedKeyMemory,
        slot: KeySlot,
    ) -> GuardResult<bool> {
        let slot_str = slot.to_string();
        let args = strings(&[
            "--verbose",
            "luksOpen",
            device,
            "--test-passphrase",
            "--key-slot",
            &slot_str,
            "-d",
            "/dev/stdin",
        ]);
        match self.cryptsetup(ctx, args, Some(passphrase)).await {
            Ok(_) => Ok(true),
            Err(err)
                if failure_stderr(&err)
                    .is_some_and(|stderr| stderr.contains("No key available with this passphrase.")) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
