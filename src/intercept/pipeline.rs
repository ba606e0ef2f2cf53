//! Pipeline delegate with companion-stage placement.
//!
//! Every operation forwards to the connection's real pipeline. The single
//! exception: a companion stage (compression by default) that a caller inserts
//! in front of the transport's decoder is moved in front of the interception
//! stage instead, so listeners never see compressed traffic.

use crate::error::{InterceptError, Result};
use crate::protocol::message::PacketCell;
use crate::transport::{Delivery, Pipeline, StageKind, StageRef};
use crate::utils::metrics::Metrics;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Required position of a companion stage relative to the interception stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// On the wire side of the interception stage.
    BeforeInterceptor,
}

/// Stage kinds with a fixed position relative to the interception stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompanionTable {
    entries: HashMap<StageKind, Placement>,
}

impl CompanionTable {
    /// A table without companions. Every insertion is forwarded as requested.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Compressor and decompressor stages sit on the wire side.
    pub fn compression() -> Self {
        Self::from_kinds([StageKind::Compressor, StageKind::Decompressor])
    }

    /// Every kind in `kinds` placed [`Placement::BeforeInterceptor`].
    pub fn from_kinds(kinds: impl IntoIterator<Item = StageKind>) -> Self {
        kinds
            .into_iter()
            .fold(Self::empty(), |table, kind| {
                table.with(kind, Placement::BeforeInterceptor)
            })
    }

    pub fn with(mut self, kind: StageKind, placement: Placement) -> Self {
        self.entries.insert(kind, placement);
        self
    }

    pub fn placement(&self, kind: StageKind) -> Option<Placement> {
        self.entries.get(&kind).copied()
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.entries.keys().copied().collect()
    }
}

impl Default for CompanionTable {
    fn default() -> Self {
        Self::compression()
    }
}

/// Forwarding [`Pipeline`] that enforces companion placement.
pub struct PipelineDelegate {
    inner: Arc<dyn Pipeline>,
    interceptor_name: String,
    transport_decoder: String,
    companions: CompanionTable,
    metrics: Arc<Metrics>,
}

impl PipelineDelegate {
    pub fn new(
        inner: Arc<dyn Pipeline>,
        interceptor_name: impl Into<String>,
        transport_decoder: impl Into<String>,
        companions: CompanionTable,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner,
            interceptor_name: interceptor_name.into(),
            transport_decoder: transport_decoder.into(),
            companions,
            metrics,
        }
    }

    /// The wrapped pipeline.
    pub fn inner(&self) -> &Arc<dyn Pipeline> {
        &self.inner
    }

    pub fn interceptor_name(&self) -> &str {
        &self.interceptor_name
    }

    /// Where an insertion requested before `base` really goes.
    fn insertion_base<'a>(&'a self, base: &'a str, stage: &StageRef) -> &'a str {
        if base != self.transport_decoder {
            return base;
        }
        if self.companions.placement(stage.kind()) != Some(Placement::BeforeInterceptor) {
            return base;
        }
        if !self.inner.contains(&self.interceptor_name) {
            return base;
        }
        &self.interceptor_name
    }
}

impl Pipeline for PipelineDelegate {
    fn add_first(&self, name: &str, stage: StageRef) -> Result<()> {
        self.inner.add_first(name, stage)
    }

    fn add_last(&self, name: &str, stage: StageRef) -> Result<()> {
        self.inner.add_last(name, stage)
    }

    fn add_before(&self, base: &str, name: &str, stage: StageRef) -> Result<()> {
        let target = self.insertion_base(base, &stage);
        if target != base {
            self.metrics.companion_redirect();
            debug!(
                stage = name,
                kind = %stage.kind(),
                requested = base,
                placed_before = target,
                "Companion stage moved in front of interception stage"
            );
        }
        self.inner.add_before(target, name, stage)
    }

    fn add_after(&self, base: &str, name: &str, stage: StageRef) -> Result<()> {
        self.inner.add_after(base, name, stage)
    }

    fn remove(&self, name: &str) -> Result<StageRef> {
        self.inner.remove(name)
    }

    fn remove_stage(&self, stage: &StageRef) -> Result<String> {
        self.inner.remove_stage(stage)
    }

    fn remove_type(&self, type_id: TypeId) -> Result<(String, StageRef)> {
        self.inner.remove_type(type_id)
    }

    fn remove_first(&self) -> Option<(String, StageRef)> {
        self.inner.remove_first()
    }

    fn remove_last(&self) -> Option<(String, StageRef)> {
        self.inner.remove_last()
    }

    fn replace(&self, old: &str, new_name: &str, stage: StageRef) -> Result<StageRef> {
        self.inner.replace(old, new_name, stage)
    }

    fn get(&self, name: &str) -> Option<StageRef> {
        self.inner.get(name)
    }

    fn get_by_type(&self, type_id: TypeId) -> Option<(String, StageRef)> {
        self.inner.get_by_type(type_id)
    }

    fn first(&self) -> Option<(String, StageRef)> {
        self.inner.first()
    }

    fn last(&self) -> Option<(String, StageRef)> {
        self.inner.last()
    }

    fn names(&self) -> Vec<String> {
        self.inner.names()
    }

    fn stages(&self) -> Vec<(String, StageRef)> {
        self.inner.stages()
    }

    fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    fn fire_read(&self, cell: &PacketCell, skip: Option<&str>) -> Result<Delivery> {
        self.inner.fire_read(cell, skip)
    }

    fn fire_write(&self, cell: &PacketCell, skip: Option<&str>) -> Result<Delivery> {
        self.inner.fire_write(cell, skip)
    }

    fn fire_exception(&self, error: InterceptError) {
        self.inner.fire_exception(error)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::transport::local::LocalPipeline;
    use crate::transport::Stage;

    struct Plain;
    impl Stage for Plain {}

    struct Zip;
    impl Stage for Zip {
        fn kind(&self) -> StageKind {
            StageKind::Compressor
        }
    }

    fn delegate(companions: CompanionTable) -> (Arc<LocalPipeline>, PipelineDelegate, Arc<Metrics>) {
        let (real, _endpoint) = LocalPipeline::new();
        real.add_last("interceptor", Arc::new(Plain)).unwrap();
        real.add_last("decoder", Arc::new(Plain)).unwrap();
        real.add_last("handler", Arc::new(Plain)).unwrap();
        let metrics = Arc::new(Metrics::new());
        let inner: Arc<dyn Pipeline> = real.clone();
        let delegate =
            PipelineDelegate::new(inner, "interceptor", "decoder", companions, Arc::clone(&metrics));
        (real, delegate, metrics)
    }

    #[test]
    fn test_companion_table_defaults() {
        let table = CompanionTable::default();
        assert_eq!(
            table.placement(StageKind::Decompressor),
            Some(Placement::BeforeInterceptor)
        );
        assert_eq!(table.placement(StageKind::Encoder), None);
        assert!(CompanionTable::empty().kinds().is_empty());
    }

    #[test]
    fn test_compressor_redirected() {
        let (real, delegate, metrics) = delegate(CompanionTable::default());
        delegate.add_before("decoder", "zip", Arc::new(Zip)).unwrap();
        assert_eq!(real.names(), vec!["zip", "interceptor", "decoder", "handler"]);
        assert_eq!(metrics.snapshot().companion_redirects, 1);
    }

    #[test]
    fn test_plain_stage_not_redirected() {
        let (real, delegate, metrics) = delegate(CompanionTable::default());
        delegate.add_before("decoder", "plain", Arc::new(Plain)).unwrap();
        assert_eq!(real.names(), vec!["interceptor", "plain", "decoder", "handler"]);
        assert_eq!(metrics.snapshot().companion_redirects, 0);
    }

    #[test]
    fn test_empty_table_forwards_verbatim() {
        let (real, delegate, _metrics) = delegate(CompanionTable::empty());
        delegate.add_before("decoder", "zip", Arc::new(Zip)).unwrap();
        assert_eq!(real.names(), vec!["interceptor", "zip", "decoder", "handler"]);
    }
}
