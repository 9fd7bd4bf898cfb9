//! 声明式 barrier 表
//!
//! 每一行描述某类资源从一个 stage 类别交给另一个 stage 类别时应当发生什么。
//! 编排器只查表，不在调用点手写 barrier。

use std::fmt::Display;

use indexmap::IndexMap;

use crate::resource_state::{RgBufferState, RgImageState};

/// stage 的类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageCategory {
    Geometry,
    RayTracing,
    Overlay,
    PresentCopy,
    /// host 发起的上传
    Transfer,
}
impl Display for StageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Geometry => "Geometry",
            Self::RayTracing => "RayTracing",
            Self::Overlay => "Overlay",
            Self::PresentCopy => "PresentCopy",
            Self::Transfer => "Transfer",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ColorImage,
    DepthImage,
    StorageBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BarrierKey {
    pub producer: StageCategory,
    pub consumer: StageCategory,
    pub kind: ResourceKind,
}
impl BarrierKey {
    #[inline]
    pub const fn new(producer: StageCategory, consumer: StageCategory, kind: ResourceKind) -> Self {
        Self {
            producer,
            consumer,
            kind,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierRule<S> {
    /// 消费者直接在生产者留下的 layout 上工作，不插入 barrier；
    /// 消费者的 stage/access 会并入记录中的状态，后续 barrier 会覆盖它的写入
    SharedState,
    /// 转换到 `dst`；`src` 为 `None` 时接受任意已记录状态
    Transition { src: Option<S>, dst: S },
}

#[derive(Clone, Debug, Default)]
pub struct BarrierTable {
    image_rules: IndexMap<BarrierKey, BarrierRule<RgImageState>>,
    buffer_rules: IndexMap<BarrierKey, BarrierRule<RgBufferState>>,
}
// new & init
impl BarrierTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 帧管线使用的规则
    pub fn restir() -> Self {
        use ResourceKind::*;
        use StageCategory::*;

        let mut table = Self::new();
        table
            // 几何 pass 写完深度后，光追着色器采样深度
            .with_image_rule(
                BarrierKey::new(Geometry, RayTracing, DepthImage),
                BarrierRule::Transition {
                    src: Some(RgImageState::DEPTH_ATTACHMENT_WRITE),
                    dst: RgImageState::DEPTH_READ_RAY_TRACING,
                },
            )
            .with_image_rule(
                BarrierKey::new(Geometry, RayTracing, ColorImage),
                BarrierRule::Transition {
                    src: None,
                    dst: RgImageState::STORAGE_READ_RAY_TRACING,
                },
            )
            .with_image_rule(BarrierKey::new(Geometry, Overlay, ColorImage), BarrierRule::SharedState)
            .with_image_rule(BarrierKey::new(RayTracing, Overlay, ColorImage), BarrierRule::SharedState)
            .with_image_rule(
                BarrierKey::new(Overlay, PresentCopy, ColorImage),
                BarrierRule::Transition {
                    src: None,
                    dst: RgImageState::TRANSFER_SRC,
                },
            )
            // 下一帧的生产者重新写入上一帧留下的输出
            .with_image_rule(
                BarrierKey::new(RayTracing, Geometry, DepthImage),
                BarrierRule::Transition {
                    src: Some(RgImageState::DEPTH_READ_RAY_TRACING),
                    dst: RgImageState::DEPTH_ATTACHMENT_WRITE,
                },
            )
            .with_image_rule(
                BarrierKey::new(RayTracing, Geometry, ColorImage),
                BarrierRule::Transition {
                    src: Some(RgImageState::STORAGE_READ_RAY_TRACING),
                    dst: RgImageState::COLOR_ATTACHMENT_WRITE,
                },
            )
            .with_image_rule(
                BarrierKey::new(Overlay, Geometry, ColorImage),
                BarrierRule::Transition {
                    src: None,
                    dst: RgImageState::COLOR_ATTACHMENT_WRITE,
                },
            )
            .with_image_rule(
                BarrierKey::new(PresentCopy, Geometry, ColorImage),
                BarrierRule::Transition {
                    src: Some(RgImageState::TRANSFER_SRC),
                    dst: RgImageState::COLOR_ATTACHMENT_WRITE,
                },
            )
            .with_image_rule(
                BarrierKey::new(RayTracing, RayTracing, ColorImage),
                BarrierRule::Transition {
                    src: None,
                    dst: RgImageState::STORAGE_WRITE_RAY_TRACING,
                },
            )
            .with_image_rule(
                BarrierKey::new(Overlay, RayTracing, ColorImage),
                BarrierRule::Transition {
                    src: None,
                    dst: RgImageState::STORAGE_WRITE_RAY_TRACING,
                },
            )
            .with_image_rule(
                BarrierKey::new(PresentCopy, RayTracing, ColorImage),
                BarrierRule::Transition {
                    src: Some(RgImageState::TRANSFER_SRC),
                    dst: RgImageState::STORAGE_WRITE_RAY_TRACING,
                },
            )
            .with_buffer_rule(
                BarrierKey::new(Transfer, RayTracing, StorageBuffer),
                BarrierRule::Transition {
                    src: Some(RgBufferState::TRANSFER_DST),
                    dst: RgBufferState::STORAGE_READ_RAY_TRACING,
                },
            );
        table
    }

    pub fn with_image_rule(&mut self, key: BarrierKey, rule: BarrierRule<RgImageState>) -> &mut Self {
        assert_ne!(key.kind, ResourceKind::StorageBuffer, "image rule registered for a buffer kind: {key:?}");
        self.image_rules.insert(key, rule);
        self
    }

    pub fn with_buffer_rule(&mut self, key: BarrierKey, rule: BarrierRule<RgBufferState>) -> &mut Self {
        assert_eq!(key.kind, ResourceKind::StorageBuffer, "buffer rule registered for an image kind: {key:?}");
        self.buffer_rules.insert(key, rule);
        self
    }
}
// getter
impl BarrierTable {
    #[inline]
    pub fn image_rule(&self, key: &BarrierKey) -> Option<&BarrierRule<RgImageState>> {
        self.image_rules.get(key)
    }

    #[inline]
    pub fn buffer_rule(&self, key: &BarrierKey) -> Option<&BarrierRule<RgBufferState>> {
        self.buffer_rules.get(key)
    }
}
// tools
impl BarrierTable {
    /// 打印所有规则
    pub fn print_rules(&self) {
        log::debug!("╔══════════════════════════════════════╗");
        log::debug!("║            Barrier Table             ║");
        log::debug!("╠══════════════════════════════════════╣");
        for (key, rule) in &self.image_rules {
            match rule {
                BarrierRule::SharedState => {
                    log::debug!("║ {} -> {} [{:?}]: shared state", key.producer, key.consumer, key.kind)
                }
                BarrierRule::Transition { src, dst } => log::debug!(
                    "║ {} -> {} [{:?}]: {:?} -> {:?}",
                    key.producer,
                    key.consumer,
                    key.kind,
                    src.map(|s| s.layout),
                    dst.layout
                ),
            }
        }
        for (key, rule) in &self.buffer_rules {
            log::debug!("║ {} -> {} [{:?}]: {:?}", key.producer, key.consumer, key.kind, rule);
        }
        log::debug!("╚══════════════════════════════════════╝");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restir_table_rows() {
        let table = BarrierTable::restir();

        let depth = table
            .image_rule(&BarrierKey::new(StageCategory::Geometry, StageCategory::RayTracing, ResourceKind::DepthImage))
            .copied();
        assert_eq!(
            depth,
            Some(BarrierRule::Transition {
                src: Some(RgImageState::DEPTH_ATTACHMENT_WRITE),
                dst: RgImageState::DEPTH_READ_RAY_TRACING,
            })
        );

        let overlay = table
            .image_rule(&BarrierKey::new(StageCategory::RayTracing, StageCategory::Overlay, ResourceKind::ColorImage))
            .copied();
        assert_eq!(overlay, Some(BarrierRule::SharedState));

        let rewrite = table
            .image_rule(&BarrierKey::new(StageCategory::PresentCopy, StageCategory::Geometry, ResourceKind::ColorImage))
            .copied();
        assert_eq!(
            rewrite,
            Some(BarrierRule::Transition {
                src: Some(RgImageState::TRANSFER_SRC),
                dst: RgImageState::COLOR_ATTACHMENT_WRITE,
            })
        );

        // 深度从不显示，也就不会被 present 拷贝
        assert!(
            table
                .image_rule(&BarrierKey::new(StageCategory::PresentCopy, StageCategory::Geometry, ResourceKind::DepthImage))
                .is_none()
        );
    }

    #[test]
    #[should_panic]
    fn test_buffer_rule_with_image_kind_panics() {
        BarrierTable::new().with_buffer_rule(
            BarrierKey::new(StageCategory::Transfer, StageCategory::RayTracing, ResourceKind::ColorImage),
            BarrierRule::SharedState,
        );
    }
}
