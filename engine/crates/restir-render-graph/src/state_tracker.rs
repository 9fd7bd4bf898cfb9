//! 资源状态跟踪
//!
//! 记录每个 image / buffer 在 host 侧看到的最后一个同步状态，并按 [`BarrierTable`]
//! 推导从当前状态到目标状态所需的最小 barrier。
//!
//! 任何不被支持的状态转换都是编程错误，直接 panic：错误的同步会导致 GPU 未定义行为，
//! 不能被静默吞掉。

use slotmap::SecondaryMap;

use restir_gfx::resources::handles::{GfxBufferHandle, GfxImageHandle};

use crate::{
    barrier::{RgBarrier, RgBufferBarrierDesc, RgImageBarrierDesc},
    barrier_table::{BarrierKey, BarrierRule, BarrierTable, ResourceKind, StageCategory},
    resource_state::{RgBufferState, RgImageState},
};

/// 被跟踪的资源
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RgResource {
    Image(GfxImageHandle),
    Buffer(GfxBufferHandle),
}

/// 资源的目标状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RgState {
    Image(RgImageState),
    Buffer(RgBufferState),
}

#[derive(Clone, Copy, Debug)]
struct TrackedImage {
    kind: ResourceKind,
    aspect: ash::vk::ImageAspectFlags,
    state: RgImageState,
    /// 最后一次通过 tracker 使用该 image 的 stage；刚开始跟踪时为 `None`
    last_user: Option<StageCategory>,
}

/// 录制失败时回滚用的状态快照
#[derive(Clone, Debug)]
pub struct TrackerSnapshot {
    images: SecondaryMap<GfxImageHandle, TrackedImage>,
    buffers: SecondaryMap<GfxBufferHandle, RgBufferState>,
}

pub struct ResourceStateTracker {
    table: BarrierTable,
    images: SecondaryMap<GfxImageHandle, TrackedImage>,
    buffers: SecondaryMap<GfxBufferHandle, RgBufferState>,
}
// new & init
impl ResourceStateTracker {
    pub fn new(table: BarrierTable) -> Self {
        Self {
            table,
            images: SecondaryMap::new(),
            buffers: SecondaryMap::new(),
        }
    }

    /// 开始跟踪一个 image；已经在跟踪时覆盖原来的记录
    pub fn track_image(
        &mut self,
        handle: GfxImageHandle,
        kind: ResourceKind,
        aspect: ash::vk::ImageAspectFlags,
        initial: RgImageState,
    ) {
        assert_ne!(kind, ResourceKind::StorageBuffer, "image {handle:?} tracked as a buffer");
        self.images.insert(
            handle,
            TrackedImage {
                kind,
                aspect,
                state: initial,
                last_user: None,
            },
        );
    }

    pub fn track_buffer(&mut self, handle: GfxBufferHandle, initial: RgBufferState) {
        self.buffers.insert(handle, initial);
    }

    /// 资源被销毁或重新分配后调用
    pub fn forget_image(&mut self, handle: GfxImageHandle) -> bool {
        self.images.remove(handle).is_some()
    }

    pub fn forget_buffer(&mut self, handle: GfxBufferHandle) -> bool {
        self.buffers.remove(handle).is_some()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            images: self.images.clone(),
            buffers: self.buffers.clone(),
        }
    }

    /// 丢弃快照之后的所有状态变化，用于没有被提交的录制
    pub fn restore(&mut self, snapshot: TrackerSnapshot) {
        self.images = snapshot.images;
        self.buffers = snapshot.buffers;
    }
}
// getter
impl ResourceStateTracker {
    #[inline]
    pub fn table(&self) -> &BarrierTable {
        &self.table
    }

    #[inline]
    pub fn image_state(&self, handle: GfxImageHandle) -> Option<RgImageState> {
        self.images.get(handle).map(|tracked| tracked.state)
    }

    #[inline]
    pub fn buffer_state(&self, handle: GfxBufferHandle) -> Option<RgBufferState> {
        self.buffers.get(handle).copied()
    }

    #[inline]
    pub fn image_last_user(&self, handle: GfxImageHandle) -> Option<StageCategory> {
        self.images.get(handle).and_then(|tracked| tracked.last_user)
    }

    #[inline]
    pub fn is_tracking_image(&self, handle: GfxImageHandle) -> bool {
        self.images.contains_key(handle)
    }

    #[inline]
    pub fn tracked_image_count(&self) -> usize {
        self.images.len()
    }
}
// 状态记录
impl ResourceStateTracker {
    /// stage 报告它录制完成后资源所处的状态，不产生 barrier
    ///
    /// stage 内部自己处理的转换（例如从 UNDEFINED 开始写 attachment）通过这里同步给 tracker
    pub fn assume_image_state(&mut self, handle: GfxImageHandle, state: RgImageState) {
        let tracked = self
            .images
            .get_mut(handle)
            .unwrap_or_else(|| panic!("assume state of untracked image {handle:?}"));
        Self::validate_image_state(handle, tracked.kind, &state);
        tracked.state = state;
    }

    pub fn assume_buffer_state(&mut self, handle: GfxBufferHandle, state: RgBufferState) {
        let tracked = self
            .buffers
            .get_mut(handle)
            .unwrap_or_else(|| panic!("assume state of untracked buffer {handle:?}"));
        *tracked = state;
    }
}
// 状态转换
impl ResourceStateTracker {
    /// 把 `resource` 转换到 `requested`，返回需要录制的 barrier
    ///
    /// 已经处于 `requested` 时返回 `None`。资源种类和状态种类必须一致。
    pub fn transition(
        &mut self,
        resource: RgResource,
        requested: RgState,
        producer: StageCategory,
        consumer: StageCategory,
    ) -> Option<RgBarrier> {
        match (resource, requested) {
            (RgResource::Image(handle), RgState::Image(state)) => {
                self.transition_image(handle, state, producer, consumer).map(RgBarrier::Image)
            }
            (RgResource::Buffer(handle), RgState::Buffer(state)) => {
                self.transition_buffer(handle, state, producer, consumer).map(RgBarrier::Buffer)
            }
            (resource, requested) => panic!("resource {resource:?} cannot be transitioned to {requested:?}"),
        }
    }

    pub fn transition_image(
        &mut self,
        handle: GfxImageHandle,
        requested: RgImageState,
        producer: StageCategory,
        consumer: StageCategory,
    ) -> Option<RgImageBarrierDesc> {
        self.transition_image_impl(handle, requested, producer, consumer, false)
    }

    /// stage 录制前取得它要写入的 image
    ///
    /// 生产者是上一次使用该 image 的 stage，通常来自上一帧。开始跟踪后还没有被使用过的 image
    /// 没有有效内容，直接从记录的状态转换，不查表。目标状态包含写入时，即使状态不变也返回 barrier，
    /// 让这次写入排在上一次访问之后。
    pub fn acquire_image(
        &mut self,
        handle: GfxImageHandle,
        requested: RgImageState,
        consumer: StageCategory,
    ) -> Option<RgImageBarrierDesc> {
        let tracked = *self
            .images
            .get(handle)
            .unwrap_or_else(|| panic!("acquire of untracked image {handle:?} by {consumer}"));

        match tracked.last_user {
            Some(producer) => self.transition_image_impl(handle, requested, producer, consumer, true),
            None => {
                Self::validate_image_state(handle, tracked.kind, &requested);
                self.record_image_use(handle, requested, consumer);
                if tracked.state == requested {
                    return None;
                }
                log::trace!("{consumer}: first use of image {handle:?} in {:?}", requested.layout);
                Some(RgImageBarrierDesc::new(handle, tracked.state, requested).with_aspect(tracked.aspect))
            }
        }
    }

    fn transition_image_impl(
        &mut self,
        handle: GfxImageHandle,
        requested: RgImageState,
        producer: StageCategory,
        consumer: StageCategory,
        order_writes: bool,
    ) -> Option<RgImageBarrierDesc> {
        let tracked = *self
            .images
            .get(handle)
            .unwrap_or_else(|| panic!("transition of untracked image {handle:?} ({producer} -> {consumer})"));
        if tracked.state == requested && !(order_writes && requested.is_write()) {
            self.record_image_use(handle, requested, consumer);
            return None;
        }

        Self::validate_image_state(handle, tracked.kind, &requested);

        let key = BarrierKey::new(producer, consumer, tracked.kind);
        let rule = self
            .table
            .image_rule(&key)
            .copied()
            .unwrap_or_else(|| panic!("no barrier rule for {key:?} (image {handle:?})"));

        match rule {
            BarrierRule::SharedState => {
                assert_eq!(
                    tracked.state.layout, requested.layout,
                    "{producer} -> {consumer} shares state of image {handle:?}, but the layout would change"
                );
                let merged = tracked.state.merged(&requested);
                self.record_image_use(handle, merged, consumer);
                log::trace!("{producer} -> {consumer}: image {handle:?} shared in {:?}", merged.layout);
                None
            }
            BarrierRule::Transition { src, dst } => {
                if let Some(src) = src {
                    assert_eq!(
                        tracked.state, src,
                        "{producer} -> {consumer}: image {handle:?} is not in the state the rule expects"
                    );
                }
                assert_eq!(dst, requested, "{producer} -> {consumer}: requested state of image {handle:?} differs from the rule");

                self.record_image_use(handle, requested, consumer);
                let barrier = RgImageBarrierDesc::new(handle, tracked.state, requested).with_aspect(tracked.aspect);
                log::trace!(
                    "{producer} -> {consumer}: image {handle:?} {:?} -> {:?}",
                    tracked.state.layout,
                    requested.layout
                );
                Some(barrier)
            }
        }
    }

    pub fn transition_buffer(
        &mut self,
        handle: GfxBufferHandle,
        requested: RgBufferState,
        producer: StageCategory,
        consumer: StageCategory,
    ) -> Option<RgBufferBarrierDesc> {
        let current = *self
            .buffers
            .get(handle)
            .unwrap_or_else(|| panic!("transition of untracked buffer {handle:?} ({producer} -> {consumer})"));
        if current == requested {
            return None;
        }

        let key = BarrierKey::new(producer, consumer, ResourceKind::StorageBuffer);
        let rule = self
            .table
            .buffer_rule(&key)
            .copied()
            .unwrap_or_else(|| panic!("no barrier rule for {key:?} (buffer {handle:?})"));

        match rule {
            BarrierRule::SharedState => {
                self.buffers.insert(
                    handle,
                    RgBufferState::new(current.stage | requested.stage, current.access | requested.access),
                );
                None
            }
            BarrierRule::Transition { src, dst } => {
                if let Some(src) = src {
                    assert_eq!(current, src, "{producer} -> {consumer}: buffer {handle:?} is not in the state the rule expects");
                }
                assert_eq!(dst, requested, "{producer} -> {consumer}: requested state of buffer {handle:?} differs from the rule");

                self.buffers.insert(handle, requested);
                Some(RgBufferBarrierDesc::new(handle, current, requested))
            }
        }
    }

    fn record_image_use(&mut self, handle: GfxImageHandle, state: RgImageState, stage: StageCategory) {
        if let Some(tracked) = self.images.get_mut(handle) {
            tracked.state = state;
            tracked.last_user = Some(stage);
        }
    }

    /// 目标状态本身是否合法
    fn validate_image_state(handle: GfxImageHandle, kind: ResourceKind, state: &RgImageState) {
        use ash::vk::ImageLayout;

        assert!(
            !matches!(state.layout, ImageLayout::UNDEFINED | ImageLayout::PREINITIALIZED),
            "unsupported transition of image {handle:?} into {:?}",
            state.layout
        );
        assert!(
            !(state.is_write() && RgImageState::is_read_only_layout(state.layout)),
            "unsupported state for image {handle:?}: write access {:?} in read-only layout {:?}",
            state.access,
            state.layout
        );
        match kind {
            ResourceKind::DepthImage => assert!(
                !RgImageState::is_color_only_layout(state.layout),
                "depth image {handle:?} requested in color layout {:?}",
                state.layout
            ),
            ResourceKind::ColorImage => assert!(
                !RgImageState::is_depth_layout(state.layout),
                "color image {handle:?} requested in depth layout {:?}",
                state.layout
            ),
            ResourceKind::StorageBuffer => unreachable!("buffers are tracked separately"),
        }
    }
}
