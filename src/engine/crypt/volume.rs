// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fmt::{self, Debug, Display},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    engine::{
        cmd::{CommandGateway, RBD},
        config::{ClusterConfig, CryptConfig},
        context::Context,
        types::VolumeId,
    },
    guard::{GuardError, GuardResult},
};

/// Location of an RBD image in the cluster.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ImageSpec {
    pub pool: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ImageSpec {
    pub fn new(pool: &str, namespace: &str, name: &str) -> ImageSpec {
        ImageSpec {
            pool: pool.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse `pool/name` or `pool/namespace/name`.
    pub fn parse(spec: &str) -> GuardResult<ImageSpec> {
        let parts = spec.split('/').collect::<Vec<_>>();
        match parts.as_slice() {
            [pool, name] if !pool.is_empty() && !name.is_empty() => {
                Ok(ImageSpec::new(pool, "", name))
            }
            [pool, namespace, name] if !pool.is_empty() && !name.is_empty() => {
                Ok(ImageSpec::new(pool, namespace, name))
            }
            _ => Err(GuardError::Msg(format!(
                "Image specification {spec:?} is not of the form pool[/namespace]/name"
            ))),
        }
    }
}

impl Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.pool, self.name)
        } else {
            write!(f, "{}/{}/{}", self.pool, self.namespace, self.name)
        }
    }
}

/// Per-volume key-value metadata held by the cluster.
#[async_trait]
pub trait VolumeMetadata: Debug + Send + Sync {
    fn volume_id(&self) -> &VolumeId;

    fn image_spec(&self) -> &ImageSpec;

    /// Read a metadata value; `None` if the key is not set.
    async fn get_metadata(&self, ctx: &Context, key: &str) -> GuardResult<Option<String>>;

    async fn set_metadata(&self, ctx: &Context, key: &str, value: &str) -> GuardResult<()>;

    /// Remove a metadata key. Removing a key that is not set succeeds.
    async fn remove_metadata(&self, ctx: &Context, key: &str) -> GuardResult<()>;
}

/// Read `key`, moving the value over from `legacy_key` first if only the
/// legacy key is set.
pub async fn migrate_metadata(
    ctx: &Context,
    volume: &dyn VolumeMetadata,
    legacy_key: &str,
    key: &str,
) -> GuardResult<Option<String>> {
    if let Some(value) = volume.get_metadata(ctx, key).await? {
        return Ok(Some(value));
    }
    match volume.get_metadata(ctx, legacy_key).await? {
        Some(value) => {
            volume.set_metadata(ctx, key, &value).await?;
            volume.remove_metadata(ctx, legacy_key).await?;
            info!(
                "Migrated metadata of volume {} from {legacy_key} to {key}",
                volume.volume_id()
            );
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Storage for the wrapped DEK of a volume, used when the KMS cannot keep
/// it itself.
#[async_trait]
pub trait DekStore: Debug + Send + Sync {
    async fn store_dek(&self, ctx: &Context, volume_id: &VolumeId, dek: &str) -> GuardResult<()>;

    async fn fetch_dek(&self, ctx: &Context, volume_id: &VolumeId) -> GuardResult<String>;

    async fn remove_dek(&self, ctx: &Context, volume_id: &VolumeId) -> GuardResult<()>;
}

/// Keeps the DEK in the metadata of the volume it belongs to. A volume
/// only ever stores its own DEK.
#[derive(Debug)]
pub struct MetadataDekStore {
    volume: Arc<dyn VolumeMetadata>,
    dek_key: String,
    legacy_dek_key: String,
}

impl MetadataDekStore {
    pub fn new(volume: Arc<dyn VolumeMetadata>, config: &CryptConfig) -> MetadataDekStore {
        MetadataDekStore {
            volume,
            dek_key: config.dek_key.clone(),
            legacy_dek_key: config.legacy_dek_key.clone(),
        }
    }

    fn check_owner(&self, volume_id: &VolumeId, action: &str) -> GuardResult<()> {
        let own = self.volume.volume_id();
        if own.is_empty() {
            Err(GuardError::InternalInvariantViolation(format!(
                "image {} has no volume id and can not {action} a DEK",
                self.volume.image_spec()
            )))
        } else if own != volume_id {
            Err(GuardError::Msg(format!(
                "volume {own} can not {action} the DEK of volume {volume_id}"
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DekStore for MetadataDekStore {
    async fn store_dek(&self, ctx: &Context, volume_id: &VolumeId, dek: &str) -> GuardResult<()> {
        self.check_owner(volume_id, "store")?;
        self.volume.set_metadata(ctx, &self.dek_key, dek).await
    }

    async fn fetch_dek(&self, ctx: &Context, volume_id: &VolumeId) -> GuardResult<String> {
        self.check_owner(volume_id, "fetch")?;
        migrate_metadata(ctx, self.volume.as_ref(), &self.legacy_dek_key, &self.dek_key)
            .await?
            .ok_or_else(|| GuardError::Msg(format!("No DEK is stored for volume {volume_id}")))
    }

    /// The metadata goes away with the image, so nothing is removed.
    async fn remove_dek(&self, _ctx: &Context, volume_id: &VolumeId) -> GuardResult<()> {
        self.check_owner(volume_id, "remove")
    }
}

/// An RBD image whose metadata is read and written with `rbd image-meta`.
#[derive(Debug)]
pub struct RbdImage {
    id: VolumeId,
    spec: ImageSpec,
    gateway: Arc<dyn CommandGateway>,
    cluster: ClusterConfig,
    timeout: Duration,
}

impl RbdImage {
    pub fn new(
        id: VolumeId,
        spec: ImageSpec,
        gateway: Arc<dyn CommandGateway>,
        cluster: ClusterConfig,
        timeout: Duration,
    ) -> RbdImage {
        RbdImage {
            id,
            spec,
            gateway,
            cluster,
            timeout,
        }
    }

    fn args(&self, op: &str, key: &str, value: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "image-meta".to_string(),
            op.to_string(),
            self.spec.to_string(),
            key.to_string(),
        ];
        if let Some(value) = value {
            args.push(value.to_string());
        }
        args.extend(self.cluster.auth_args());
        args
    }
}

/// `rbd image-meta` reports an unset key as ENOENT.
fn is_missing_key(err: &GuardError) -> bool {
    matches!(
        err,
        GuardError::CommandFailed { stderr, .. } if stderr.contains("No such file or directory")
    )
}

#[async_trait]
impl VolumeMetadata for RbdImage {
    fn volume_id(&self) -> &VolumeId {
        &self.id
    }

    fn image_spec(&self) -> &ImageSpec {
        &self.spec
    }

    async fn get_metadata(&self, ctx: &Context, key: &str) -> GuardResult<Option<String>> {
        let args = self.args("get", key, None);
        match self.gateway.execute(ctx, self.timeout, RBD, &args, None).await {
            Ok(output) => Ok(Some(output.stdout.trim_end_matches('\n').to_string())),
            Err(err) if is_missing_key(&err) => Ok(None),
            Err(err) => Err(GuardError::Chained(
                format!("Failed to read metadata {key} of image {}", self.spec),
                Box::new(err),
            )),
        }
    }

    async fn set_metadata(&self, ctx: &Context, key: &str, value: &str) -> GuardResult<()> {
        let args = self.args("set", key, Some(value));
        chain_err!(
            self.gateway.execute(ctx, self.timeout, RBD, &args, None).await,
            "Failed to set metadata {} of image {}",
            key,
            self.spec
        )?;
        Ok(())
    }

    async fn remove_metadata(&self, ctx: &Context, key: &str) -> GuardResult<()> {
        let args = self.args("remove", key, None);
        match self.gateway.execute(ctx, self.timeout, RBD, &args, None).await {
            Ok(_) => Ok(()),
            Err(err) if is_missing_key(&err) => Ok(()),
            Err(err) => Err(GuardError::Chained(
                format!("Failed to remove metadata {key} of image {}", self.spec),
                Box::new(err),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{
        cmd::CommandOutput,
        sim::{ScriptedGateway, SimVolume},
    };

    use super::*;

    #[test]
    fn test_image_spec() {
        assert_eq!(
            ImageSpec::parse("rbd/csi-vol-1").unwrap(),
            ImageSpec::new("rbd", "", "csi-vol-1")
        );
        let spec = ImageSpec::parse("rbd/tenant/csi-vol-1").unwrap();
        assert_eq!(spec.to_string(), "rbd/tenant/csi-vol-1");
        assert_matches!(ImageSpec::parse("csi-vol-1"), Err(GuardError::Msg(_)));
        assert_matches!(ImageSpec::parse("/csi-vol-1"), Err(GuardError::Msg(_)));
    }

    #[tokio::test]
    async fn test_migrate_metadata() {
        let ctx = Context::background();
        let volume = SimVolume::new("vol-1");
        volume.set_metadata(&ctx, ".old", "value").await.unwrap();

        assert_eq!(
            migrate_metadata(&ctx, &volume, ".old", "new").await.unwrap(),
            Some("value".to_string())
        );
        assert_eq!(volume.get_metadata(&ctx, ".old").await.unwrap(), None);
        assert_eq!(
            volume.get_metadata(&ctx, "new").await.unwrap(),
            Some("value".to_string())
        );
        assert_eq!(
            migrate_metadata(&ctx, &volume, ".other", "absent").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_dek_store_owner_checks() {
        let ctx = Context::background();
        let store = MetadataDekStore::new(Arc::new(SimVolume::new("vol-1")), &CryptConfig::default());
        store.store_dek(&ctx, &VolumeId::from("vol-1"), "wrapped").await.unwrap();
        assert_eq!(
            store.fetch_dek(&ctx, &VolumeId::from("vol-1")).await.unwrap(),
            "wrapped"
        );
        assert_matches!(
            store.fetch_dek(&ctx, &VolumeId::from("vol-2")).await,
            Err(GuardError::Msg(_))
        );

        let anonymous = MetadataDekStore::new(Arc::new(SimVolume::new("")), &CryptConfig::default());
        assert_matches!(
            anonymous.store_dek(&ctx, &VolumeId::from(""), "x").await,
            Err(GuardError::InternalInvariantViolation(_))
        );
    }

    #[tokio::test]
    async fn test_rbd_image_commands() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.push_response(Ok(CommandOutput {
            stdout: "encrypted\n".to_string(),
            stderr: String::new(),
        }));
        gateway.push_response(Err(GuardError::CommandFailed {
            cmd: "rbd image-meta get".to_string(),
            status: Some(2),
            stderr: "failed to get metadata: (2) No such file or directory".to_string(),
        }));
        let image = RbdImage::new(
            VolumeId::from("vol-1"),
            ImageSpec::new("rbd", "", "img"),
            Arc::clone(&gateway) as Arc<_>,
            ClusterConfig {
                client_id: "csi".to_string(),
                key_file: "/tmp/key".to_string(),
                monitors: "mon1".to_string(),
                ..Default::default()
            },
            Duration::from_secs(10),
        );
        let ctx = Context::background();
        assert_eq!(
            image.get_metadata(&ctx, "k").await.unwrap(),
            Some("encrypted".to_string())
        );
        assert_eq!(image.get_metadata(&ctx, "k").await.unwrap(), None);
        image.set_metadata(&ctx, "k", "v").await.unwrap();

        let calls = gateway.calls();
        assert_eq!(calls[0].program, RBD);
        assert_eq!(
            calls[2].args,
            vec![
                "image-meta", "set", "rbd/img", "k", "v", "--id", "csi", "--keyfile=/tmp/key",
                "-m", "mon1"
            ]
        );
    }
}
