// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use retry::delay::Fixed;

use crate::{
    engine::{
        cmd::{CommandGateway, RBD},
        config::ClusterConfig,
        context::Context,
        crypt::volume::ImageSpec,
    },
    guard::{GuardError, GuardResult},
};

/// Finds the local block device an image is mapped to.
#[async_trait]
pub trait DeviceLocator: Debug + Send + Sync {
    /// The device path of `image`, or `None` if it is not mapped here.
    async fn locate(&self, ctx: &Context, image: &ImageSpec) -> GuardResult<Option<String>>;
}

/// Poll `locator` until the device for `image` shows up, trying at most
/// `attempts` times.
pub async fn wait_for_device(
    ctx: &Context,
    locator: &dyn DeviceLocator,
    image: &ImageSpec,
    attempts: usize,
    interval: Duration,
) -> GuardResult<String> {
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    for (i, delay) in Fixed::from_millis(interval_ms).take(attempts).enumerate() {
        if let Some(path) = locator.locate(ctx, image).await? {
            debug!("Image {image} is mapped at {path}");
            return Ok(path);
        }
        if i + 1 < attempts {
            trace!("Image {image} is not mapped yet; attempt {} of {attempts}", i + 1);
            ctx.sleep(delay).await?;
        }
    }
    Err(GuardError::DeviceNotFound(format!(
        "image {image} is not mapped on this host after {attempts} attempts"
    )))
}

/// One entry of `rbd device list --format json`.
#[derive(Debug, Deserialize)]
struct MappedDevice {
    #[serde(default)]
    pool: String,
    #[serde(default)]
    namespace: String,
    name: String,
    #[serde(default)]
    snap: String,
    device: String,
}

impl MappedDevice {
    fn matches(&self, image: &ImageSpec) -> bool {
        self.pool == image.pool
            && self.namespace == image.namespace
            && self.name == image.name
            && (self.snap.is_empty() || self.snap == "-")
    }
}

/// `DeviceLocator` that asks `rbd device list`.
#[derive(Debug)]
pub struct RbdDeviceLocator {
    gateway: Arc<dyn CommandGateway>,
    cluster: ClusterConfig,
    device_type: String,
    timeout: Duration,
}

impl RbdDeviceLocator {
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        cluster: ClusterConfig,
        device_type: &str,
        timeout: Duration,
    ) -> RbdDeviceLocator {
        RbdDeviceLocator {
            gateway,
            cluster,
            device_type: device_type.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl DeviceLocator for RbdDeviceLocator {
    async fn locate(&self, ctx: &Context, image: &ImageSpec) -> GuardResult<Option<String>> {
        let mut args = vec![
            "device".to_string(),
            "list".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        if !self.device_type.is_empty() && self.device_type != "krbd" {
            args.push("--device-type".to_string());
            args.push(self.device_type.clone());
        }
        args.extend(self.cluster.auth_args());
        let output = chain_err!(
            self.gateway.execute(ctx, self.timeout, RBD, &args, None).await,
            "Failed to list mapped rbd devices"
        )?;
        let devices: Vec<MappedDevice> = serde_json::from_str(&output.stdout).map_err(|e| {
            GuardError::ProtocolError(format!("rbd device list is not a JSON array: {e}"))
        })?;
        Ok(devices
            .into_iter()
            .find(|d| d.matches(image))
            .map(|d| d.device))
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{
        cmd::CommandOutput,
        sim::{ScriptedGateway, SimDeviceLocator},
    };

    use super::*;

    #[tokio::test]
    async fn test_rbd_device_list() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.push_response(Ok(CommandOutput {
            stdout: json!([
                {"id": "0", "pool": "rbd", "namespace": "", "name": "other", "snap": "-", "device": "/dev/rbd0"},
                {"id": "1", "pool": "rbd", "namespace": "", "name": "img", "snap": "snap1", "device": "/dev/rbd1"},
                {"id": "2", "pool": "rbd", "namespace": "", "name": "img", "snap": "-", "device": "/dev/rbd2"}
            ])
            .to_string(),
            stderr: String::new(),
        }));
        let locator = RbdDeviceLocator::new(
            Arc::clone(&gateway) as Arc<_>,
            ClusterConfig::default(),
            "nbd",
            Duration::from_secs(10),
        );
        assert_eq!(
            locator
                .locate(&Context::background(), &ImageSpec::new("rbd", "", "img"))
                .await
                .unwrap(),
            Some("/dev/rbd2".to_string())
        );
        let calls = gateway.calls();
        let args = &calls[0].args;
        assert_eq!(args[..6], ["device", "list", "--format", "json", "--device-type", "nbd"]);
    }

    #[tokio::test]
    async fn test_wait_for_device() {
        let image = ImageSpec::new("rbd", "", "img");
        let locator = SimDeviceLocator::default();
        locator.map_after(&image, "/dev/rbd3", 2);
        let ctx = Context::background();
        assert_eq!(
            wait_for_device(&ctx, &locator, &image, 3, Duration::from_millis(1))
                .await
                .unwrap(),
            "/dev/rbd3"
        );
        assert_matches!(
            wait_for_device(
                &ctx,
                &locator,
                &ImageSpec::new("rbd", "", "absent"),
                2,
                Duration::from_millis(1)
            )
            .await,
            Err(GuardError::DeviceNotFound(_))
        );
    }
}
