// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    engine::{
        context::Context,
        crypt::{DeviceLocator, ImageSpec, VolumeMetadata},
        sim::locked,
        types::VolumeId,
    },
    guard::{GuardError, GuardResult},
};

#[derive(Debug, Default)]
struct Metadata {
    values: HashMap<String, String>,
    fail_writes: bool,
}

/// A volume whose metadata lives in memory. Its image is `rbd/<id>`.
#[derive(Debug)]
pub struct SimVolume {
    id: VolumeId,
    spec: ImageSpec,
    metadata: Mutex<Metadata>,
}

impl SimVolume {
    pub fn new(id: &str) -> SimVolume {
        SimVolume {
            id: VolumeId::from(id),
            spec: ImageSpec::new("rbd", "", id),
            metadata: Mutex::new(Metadata::default()),
        }
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        locked(&self.metadata).values.get(key).cloned()
    }

    /// Make every metadata write fail until switched off again.
    pub fn fail_writes(&self, fail: bool) {
        locked(&self.metadata).fail_writes = fail;
    }

    fn check_writable(&self, metadata: &Metadata) -> GuardResult<()> {
        if metadata.fail_writes {
            Err(GuardError::Msg(format!(
                "Simulated metadata write failure on image {}",
                self.spec
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VolumeMetadata for SimVolume {
    fn volume_id(&self) -> &VolumeId {
        &self.id
    }

    fn image_spec(&self) -> &ImageSpec {
        &self.spec
    }

    async fn get_metadata(&self, ctx: &Context, key: &str) -> GuardResult<Option<String>> {
        ctx.check()?;
        Ok(self.metadata(key))
    }

    async fn set_metadata(&self, ctx: &Context, key: &str, value: &str) -> GuardResult<()> {
        ctx.check()?;
        let mut metadata = locked(&self.metadata);
        self.check_writable(&metadata)?;
        metadata.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_metadata(&self, ctx: &Context, key: &str) -> GuardResult<()> {
        ctx.check()?;
        let mut metadata = locked(&self.metadata);
        self.check_writable(&metadata)?;
        metadata.values.remove(key);
        Ok(())
    }
}

#[derive(Debug)]
struct Mapping {
    path: String,
    visible_after: usize,
    lookups: usize,
}

/// Images mapped to local devices. A mapping can be made to show up only
/// after a number of lookups, the way a freshly mapped device appears with
/// some delay.
#[derive(Debug, Default)]
pub struct SimDeviceLocator {
    mappings: Mutex<HashMap<ImageSpec, Mapping>>,
}

impl SimDeviceLocator {
    /// Map `image` to `path`; the device is found from the `lookups`-th
    /// lookup on.
    pub fn map_after(&self, image: &ImageSpec, path: &str, lookups: usize) {
        locked(&self.mappings).insert(
            image.clone(),
            Mapping {
                path: path.to_string(),
                visible_after: lookups,
                lookups: 0,
            },
        );
    }
}

#[async_trait]
impl DeviceLocator for SimDeviceLocator {
    async fn locate(&self, ctx: &Context, image: &ImageSpec) -> GuardResult<Option<String>> {
        ctx.check()?;
        let mut mappings = locked(&self.mappings);
        Ok(mappings.get_mut(image).and_then(|mapping| {
            mapping.lookups += 1;
            if mapping.lookups >= mapping.visible_after {
                Some(mapping.path.clone())
            } else {
                None
            }
        }))
    }
}
