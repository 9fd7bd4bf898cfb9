//! 可显示输出的注册表
//!
//! 每次 stage 配置或 resize 之后重建。显示名就是 stage 声明的输出名；
//! 两个 stage 声明了同名输出时，两者都以 `stage/name` 注册。

use indexmap::IndexMap;
use itertools::Itertools;

use restir_gfx::resources::handles::GfxImageHandle;
use restir_render_graph::barrier_table::StageCategory;

use crate::error::{PipelineError, PipelineResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputEntry {
    pub stage: String,
    pub category: StageCategory,
    pub name: String,
    pub image: GfxImageHandle,
}

/// 重建注册表时一个 stage 提供的输出
pub struct StageOutputs {
    pub stage: String,
    pub category: StageCategory,
    pub outputs: Vec<(String, GfxImageHandle)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputSelection {
    #[default]
    None,
    Stable(String),
    /// 已经请求切换，等待管线在空闲点应用；此前仍然显示 `from`
    PendingChange { from: Option<String>, to: String },
}

#[derive(Default)]
pub struct OutputRegistry {
    entries: IndexMap<String, OutputEntry>,
    selection: OutputSelection,
}
// new & init
impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}
// getter
impl OutputRegistry {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&OutputEntry> {
        self.entries.get(name)
    }

    #[inline]
    pub fn selection(&self) -> &OutputSelection {
        &self.selection
    }

    /// 当前正在显示的输出名
    pub fn active_name(&self) -> Option<&str> {
        match &self.selection {
            OutputSelection::None => None,
            OutputSelection::Stable(name) => Some(name),
            OutputSelection::PendingChange { from, .. } => from.as_deref(),
        }
    }

    pub fn active_entry(&self) -> Option<&OutputEntry> {
        self.active_name().and_then(|name| self.entries.get(name))
    }

    #[inline]
    pub fn active_image(&self) -> Option<GfxImageHandle> {
        self.active_entry().map(|entry| entry.image)
    }

    #[inline]
    pub fn has_pending_change(&self) -> bool {
        matches!(self.selection, OutputSelection::PendingChange { .. })
    }
}
// update
impl OutputRegistry {
    /// 用 stage 当前的输出重建注册表
    ///
    /// 当前选择仍然存在时保持不变，否则退回第一个输出（没有输出时为 `None`）。
    /// 非空的注册表重建之后总有一个正在显示的输出。
    pub fn rebuild(&mut self, stages: Vec<StageOutputs>) {
        let name_counts = stages
            .iter()
            .flat_map(|stage| stage.outputs.iter().map(|(name, _)| name.as_str()))
            .counts();
        let colliding: Vec<String> = name_counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name.to_string())
            .collect();

        self.entries.clear();
        for stage in stages {
            for (name, image) in stage.outputs {
                let display_name = if colliding.contains(&name) {
                    format!("{}/{}", stage.stage, name)
                } else {
                    name.clone()
                };
                self.entries.insert(
                    display_name,
                    OutputEntry {
                        stage: stage.stage.clone(),
                        category: stage.category,
                        name,
                        image,
                    },
                );
            }
        }

        self.selection = match std::mem::take(&mut self.selection) {
            OutputSelection::Stable(name) if self.entries.contains_key(&name) => OutputSelection::Stable(name),
            OutputSelection::PendingChange { from: Some(from), to }
                if self.entries.contains_key(&from) && self.entries.contains_key(&to) =>
            {
                OutputSelection::PendingChange { from: Some(from), to }
            }
            // 重建总是发生在设备空闲时，原来显示的输出已经不在了就直接切过去
            OutputSelection::PendingChange { to, .. } if self.entries.contains_key(&to) => {
                log::info!("pending output change to {to} applied during rebuild");
                OutputSelection::Stable(to)
            }
            OutputSelection::PendingChange { from: Some(from), .. } if self.entries.contains_key(&from) => {
                log::warn!("pending output change dropped: target no longer exists");
                OutputSelection::Stable(from)
            }
            previous => {
                let fallback = self.fallback();
                if previous != OutputSelection::None {
                    log::info!("output selection {previous:?} is gone, falling back to {fallback:?}");
                }
                fallback
            }
        };

        log::info!(
            "output registry rebuilt: [{}], active: {:?}",
            self.entries.keys().join(", "),
            self.active_name()
        );
    }

    /// 请求切换显示的输出，真正的切换由管线在空闲点完成
    pub fn request(&mut self, name: &str) -> PipelineResult<()> {
        if !self.entries.contains_key(name) {
            return Err(PipelineError::UnknownOutput(name.to_string()));
        }

        let from = self.active_name().map(str::to_string);
        if from.as_deref() == Some(name) {
            // 请求当前输出时撤销尚未应用的切换
            self.selection = OutputSelection::Stable(name.to_string());
            return Ok(());
        }

        log::info!("output change requested: {from:?} -> {name}");
        self.selection = OutputSelection::PendingChange {
            from,
            to: name.to_string(),
        };
        Ok(())
    }

    /// 应用等待中的切换，返回新的输出
    pub fn take_pending(&mut self) -> Option<&OutputEntry> {
        let OutputSelection::PendingChange { to, .. } = &self.selection else {
            return None;
        };
        let to = to.clone();
        self.selection = OutputSelection::Stable(to.clone());
        self.entries.get(&to)
    }

    fn fallback(&self) -> OutputSelection {
        self.entries
            .keys()
            .next()
            .map_or(OutputSelection::None, |name| OutputSelection::Stable(name.clone()))
    }
}
