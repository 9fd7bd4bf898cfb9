//! 资源同步
//!
//! - [`resource_state`]：资源状态（stage / access / layout）
//! - [`barrier_table`]：按 (生产者类别, 消费者类别, 资源类型) 声明 barrier 规则
//! - [`state_tracker`]：记录每个资源当前状态，推导最小 barrier
//! - [`barrier`]：barrier 描述，转换成 gfx 层的 barrier

pub mod barrier;
pub mod barrier_table;
pub mod resource_state;
pub mod state_tracker;
