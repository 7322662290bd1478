//! The model cache: one backbone slot per partition plus independently keyed
//! shared components.
//!
//! Every slot holds at most one live instance. A rebuild prepares the new weights
//! (conversion, fusion) before touching the slot, so a failed build leaves a
//! working entry in place. Only then is the old instance dropped and the new one
//! instantiated.

mod key;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device};

pub use key::{CacheKey, ComponentKey, Invalidation, Partition};

use crate::checkpoint::{Family, FamilyDescriptor};
use crate::convert::ConvertedCheckpoint;
use crate::lora::{self, AdapterArchive, AdapterSet, LayerTable};
use crate::models::{shared, ModelFactory, Placement, Resident, Shared};
use crate::settings::ModelDirectories;
use crate::worker::Worker;
use crate::{Error, Host, Precision, Result};

/// Arguments of [`ModelCacheStore::get_or_build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub model_path: PathBuf,
    pub inpaint: bool,
    pub adapters: AdapterSet,
    pub settings_epoch: u64,
    pub precision: Precision,
}

impl ModelRequest {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            model_path: self.model_path.clone(),
            precision: self.precision,
            partition: Partition::from_inpaint(self.inpaint),
            adapters: self.adapters.clone(),
            settings_epoch: self.settings_epoch,
        }
    }
}

/// Handles to every sub-model a pipeline needs.
pub struct LoadedModel<F: ModelFactory> {
    pub descriptor: FamilyDescriptor,
    pub partition: Partition,
    /// Changes whenever this partition's backbone is rebuilt.
    pub generation: u64,
    /// Changes whenever a shared component is rebuilt.
    pub components: u64,
    pub device: Device,
    pub dtype: DType,
    pub backbone: Shared<F::Backbone>,
    pub text_encoder: Shared<F::TextEncoder>,
    pub autoencoder: Shared<F::Autoencoder>,
    pub fast_decoder: Shared<F::FastDecoder>,
    pub tokenizer: Arc<F::Tokenizer>,
}

impl<F: ModelFactory> Clone for LoadedModel<F> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            partition: self.partition,
            generation: self.generation,
            components: self.components,
            device: self.device.clone(),
            dtype: self.dtype,
            backbone: Arc::clone(&self.backbone),
            text_encoder: Arc::clone(&self.text_encoder),
            autoencoder: Arc::clone(&self.autoencoder),
            fast_decoder: Arc::clone(&self.fast_decoder),
            tokenizer: Arc::clone(&self.tokenizer),
        }
    }
}

struct Entry<K, V> {
    key: K,
    value: V,
}

struct BackboneSlot<F: ModelFactory> {
    key: Option<CacheKey>,
    descriptor: Option<FamilyDescriptor>,
    backbone: Option<Shared<F::Backbone>>,
    /// Unfused text encoder of the slot's checkpoint; survives adapter rebuilds.
    text_encoder: Option<Shared<F::TextEncoder>>,
    /// Present when the slot's adapters carry text encoder deltas.
    fused_text_encoder: Option<Shared<F::TextEncoder>>,
    /// Unfused converted state, kept when `keep_in_memory` is set.
    retained: Option<Arc<ConvertedCheckpoint>>,
    generation: u64,
}

impl<F: ModelFactory> Default for BackboneSlot<F> {
    fn default() -> Self {
        Self {
            key: None,
            descriptor: None,
            backbone: None,
            text_encoder: None,
            fused_text_encoder: None,
            retained: None,
            generation: 0,
        }
    }
}

impl<F: ModelFactory> BackboneSlot<F> {
    fn clear(&mut self) -> bool {
        let populated = self.backbone.is_some() || self.retained.is_some();
        self.key = None;
        self.descriptor = None;
        self.backbone = None;
        self.text_encoder = None;
        self.fused_text_encoder = None;
        self.retained = None;
        populated
    }
}

/// Weights ready to instantiate, produced without touching any slot.
struct PreparedBackbone {
    converted: Arc<ConvertedCheckpoint>,
    backbone: crate::checkpoint::WeightMap,
    text_encoder: Option<crate::checkpoint::WeightMap>,
}

pub struct ModelCacheStore<F: ModelFactory> {
    factory: Arc<F>,
    worker: Worker,
    dirs: ModelDirectories,
    device: Device,
    keep_in_memory: bool,
    slots: [BackboneSlot<F>; 2],
    autoencoder: Option<Entry<ComponentKey, Shared<F::Autoencoder>>>,
    fast_decoder: Option<Entry<ComponentKey, Shared<F::FastDecoder>>>,
    tokenizer: Option<Entry<Family, Arc<F::Tokenizer>>>,
    layer_tables: HashMap<(Family, bool), Arc<LayerTable>>,
    next_generation: u64,
    components_generation: u64,
}

impl<F: ModelFactory> ModelCacheStore<F> {
    pub fn new(factory: F, dirs: ModelDirectories, device: Device, keep_in_memory: bool) -> Result<Self> {
        Ok(Self {
            factory: Arc::new(factory),
            worker: Worker::spawn()?,
            dirs,
            device,
            keep_in_memory,
            slots: [BackboneSlot::default(), BackboneSlot::default()],
            autoencoder: None,
            fast_decoder: None,
            tokenizer: None,
            layer_tables: HashMap::new(),
            next_generation: 1,
            components_generation: 0,
        })
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn directories(&self) -> &ModelDirectories {
        &self.dirs
    }

    pub fn set_directories(&mut self, dirs: ModelDirectories) {
        self.dirs = dirs;
    }

    pub fn set_keep_in_memory(&mut self, keep: bool) {
        self.keep_in_memory = keep;
        if !keep {
            for slot in &mut self.slots {
                slot.retained = None;
            }
        }
    }

    /// Moving to another device drops everything; nothing is reused across devices.
    pub fn set_device(&mut self, device: Device) {
        if !self.device.same_device(&device) {
            tracing::info!(?device, "device changed, clearing model cache");
            self.clear();
            self.device = device;
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.autoencoder = None;
        self.fast_decoder = None;
        self.tokenizer = None;
    }

    /// Drops the backbone slot of `partition`. Returns whether anything was cached.
    pub fn evict(&mut self, partition: Partition) -> bool {
        let evicted = self.slots[partition.index()].clear();
        if evicted {
            tracing::info!(?partition, "evicted backbone slot");
        }
        evicted
    }

    pub fn is_populated(&self, partition: Partition) -> bool {
        self.slots[partition.index()].backbone.is_some()
    }

    /// How a `get_or_build` with `request` would treat the cached backbone.
    pub fn invalidation(&self, request: &ModelRequest) -> Invalidation {
        let key = request.key();
        let slot = &self.slots[key.partition.index()];
        match (&slot.key, &slot.backbone) {
            (Some(cached), Some(_)) => cached.invalidation(&key),
            _ => Invalidation::Full,
        }
    }

    /// Sub-models of the partitions other than `active`; candidates for relocation
    /// under memory pressure.
    pub fn idle_residents(&self, active: Partition) -> Vec<Shared<dyn Resident>> {
        let slot = &self.slots[active.other().index()];
        let mut idle: Vec<Shared<dyn Resident>> = Vec::new();
        if let Some(backbone) = &slot.backbone {
            idle.push(backbone.clone());
        }
        for text_encoder in [&slot.text_encoder, &slot.fused_text_encoder].into_iter().flatten() {
            idle.push(text_encoder.clone());
        }
        idle
    }

    pub fn get_or_build(&mut self, request: &ModelRequest, host: &dyn Host) -> Result<LoadedModel<F>> {
        let key = request.key();
        let partition = key.partition;
        let placement = Placement::new(self.device.clone(), request.precision.dtype());

        match self.invalidation(request) {
            Invalidation::None => {
                tracing::info!(?partition, model = %request.model_path.display(), "backbone cache hit");
            }
            invalidation => {
                tracing::info!(?partition, ?invalidation, model = %request.model_path.display(), "rebuilding backbone");
                let converted = match invalidation {
                    Invalidation::Adapters => self.source(request, host)?,
                    _ => self.convert(request, host)?,
                };
                let prepared = self.prepare(&key, converted, host)?;
                self.commit(key, prepared, &placement, host)?;
            }
        }

        let slot = &self.slots[partition.index()];
        let text_encoder = slot.fused_text_encoder.as_ref().or(slot.text_encoder.as_ref()).cloned();
        let (Some(descriptor), Some(backbone), Some(text_encoder)) =
            (slot.descriptor.clone(), slot.backbone.clone(), text_encoder)
        else {
            return Err(Error::ModelNotFound(request.model_path.display().to_string()));
        };
        let generation = slot.generation;
        let autoencoder = self.ensure_autoencoder(descriptor.family, request.precision, &placement, host)?;
        let fast_decoder = self.ensure_fast_decoder(descriptor.family, request.precision, &placement, host)?;
        let tokenizer = self.ensure_tokenizer(descriptor.family, host)?;

        Ok(LoadedModel {
            descriptor,
            partition,
            generation,
            components: self.components_generation,
            device: placement.device,
            dtype: placement.dtype,
            backbone,
            text_encoder,
            autoencoder,
            fast_decoder,
            tokenizer,
        })
    }

    fn convert(&self, request: &ModelRequest, host: &dyn Host) -> Result<Arc<ConvertedCheckpoint>> {
        host.report_status_text(&format!("Loading model {}", request.model_path.display()));
        let factory = Arc::clone(&self.factory);
        let path = request.model_path.clone();
        let dtype = request.precision.dtype();
        let converted = self.worker.run(host, move || factory.convert(&path, dtype))?;
        Ok(Arc::new(converted))
    }

    /// Unfused converted state for `request`: the retained copy when it matches,
    /// otherwise a fresh conversion from disk.
    fn source(&self, request: &ModelRequest, host: &dyn Host) -> Result<Arc<ConvertedCheckpoint>> {
        let key = request.key();
        let slot = &self.slots[key.partition.index()];
        if let (Some(cached), Some(retained)) = (&slot.key, &slot.retained) {
            if cached.primary_matches(&key) {
                tracing::debug!("reusing retained converted state");
                return Ok(Arc::clone(retained));
            }
        }
        self.convert(request, host)
    }

    fn layer_table(&mut self, descriptor: &FamilyDescriptor) -> Arc<LayerTable> {
        let factory = &self.factory;
        self.layer_tables
            .entry((descriptor.family, descriptor.inpaint))
            .or_insert_with(|| Arc::new(factory.layer_table(descriptor)))
            .clone()
    }

    /// Checks the mode and fuses the adapters into copies of the converted weights.
    fn prepare(
        &mut self,
        key: &CacheKey,
        converted: Arc<ConvertedCheckpoint>,
        host: &dyn Host,
    ) -> Result<PreparedBackbone> {
        let descriptor = &converted.descriptor;
        if descriptor.inpaint != key.partition.is_inpaint() {
            return Err(Error::IncompatibleModelMode {
                mode: if key.partition.is_inpaint() { "inpaint" } else { "standard" }.to_string(),
                reason: format!(
                    "{} is {}an inpainting checkpoint",
                    key.model_path.display(),
                    if descriptor.inpaint { "" } else { "not " }
                ),
            });
        }

        let plan = key.adapters.fusion_plan();
        let mut backbone = converted.backbone.clone();
        if plan.is_empty() {
            return Ok(PreparedBackbone {
                converted,
                backbone,
                text_encoder: None,
            });
        }

        let table = self.layer_table(descriptor);
        let mut text_encoder = converted.text_encoder.clone();
        let mut touched_text_encoder = false;
        for adapter in plan {
            host.report_status_text(&format!("Applying adapter {}", adapter.name));
            let path = lora::locate(&self.dirs, &adapter.name)?;
            let name = adapter.name.clone();
            let archive = self.worker.run(host, move || AdapterArchive::load(&name, &path))?;
            let report = lora::fuse(&mut backbone, &mut text_encoder, &table, &archive, adapter.weight)?;
            touched_text_encoder |= report.text_encoder_layers > 0;
        }
        Ok(PreparedBackbone {
            converted,
            backbone,
            text_encoder: touched_text_encoder.then_some(text_encoder),
        })
    }

    fn commit(
        &mut self,
        key: CacheKey,
        prepared: PreparedBackbone,
        placement: &Placement,
        host: &dyn Host,
    ) -> Result<()> {
        let slot = &mut self.slots[key.partition.index()];
        let kept_text_encoder = match &slot.key {
            Some(cached) if cached.primary_matches(&key) => slot.text_encoder.take(),
            _ => None,
        };
        slot.clear();

        host.report_status_text("Instantiating backbone");
        let descriptor = prepared.converted.descriptor.clone();
        let backbone = self.factory.backbone(&descriptor, prepared.backbone, placement)?;
        let fused_text_encoder = match prepared.text_encoder {
            Some(weights) => Some(shared(self.factory.text_encoder(&descriptor, weights, placement)?)),
            None => None,
        };
        let text_encoder = match (kept_text_encoder, &fused_text_encoder) {
            (Some(kept), _) => Some(kept),
            (None, Some(_)) => None,
            (None, None) => {
                host.report_status_text("Loading text encoder");
                let weights = prepared.converted.text_encoder.clone();
                Some(shared(self.factory.text_encoder(&descriptor, weights, placement)?))
            }
        };

        slot.backbone = Some(shared(backbone));
        slot.text_encoder = text_encoder;
        slot.fused_text_encoder = fused_text_encoder;
        slot.retained = self.keep_in_memory.then_some(prepared.converted);
        slot.descriptor = Some(descriptor);
        slot.key = Some(key);
        slot.generation = self.next_generation;
        self.next_generation += 1;
        Ok(())
    }

    fn ensure_autoencoder(
        &mut self,
        family: Family,
        precision: Precision,
        placement: &Placement,
        host: &dyn Host,
    ) -> Result<Shared<F::Autoencoder>> {
        let key = ComponentKey { family, precision };
        if let Some(entry) = self.autoencoder.as_ref().filter(|e| e.key == key) {
            return Ok(entry.value.clone());
        }
        self.autoencoder = None;
        host.report_status_text("Loading autoencoder");
        let factory = Arc::clone(&self.factory);
        let placement = placement.clone();
        let model = shared(self.worker.run(host, move || factory.autoencoder(family, &placement))?);
        self.autoencoder = Some(Entry {
            key,
            value: model.clone(),
        });
        self.components_generation += 1;
        Ok(model)
    }

    fn ensure_fast_decoder(
        &mut self,
        family: Family,
        precision: Precision,
        placement: &Placement,
        host: &dyn Host,
    ) -> Result<Shared<F::FastDecoder>> {
        let key = ComponentKey { family, precision };
        if let Some(entry) = self.fast_decoder.as_ref().filter(|e| e.key == key) {
            return Ok(entry.value.clone());
        }
        self.fast_decoder = None;
        host.report_status_text("Loading preview decoder");
        let factory = Arc::clone(&self.factory);
        let placement = placement.clone();
        let model = shared(self.worker.run(host, move || factory.fast_decoder(family, &placement))?);
        self.fast_decoder = Some(Entry {
            key,
            value: model.clone(),
        });
        self.components_generation += 1;
        Ok(model)
    }

    fn ensure_tokenizer(&mut self, family: Family, host: &dyn Host) -> Result<Arc<F::Tokenizer>> {
        if let Some(entry) = self.tokenizer.as_ref().filter(|e| e.key == family) {
            return Ok(entry.value.clone());
        }
        let factory = Arc::clone(&self.factory);
        let tokenizer = Arc::new(self.worker.run(host, move || factory.tokenizer(family))?);
        self.tokenizer = Some(Entry {
            key: family,
            value: tokenizer.clone(),
        });
        self.components_generation += 1;
        Ok(tokenizer)
    }
}
