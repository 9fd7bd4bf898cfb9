//! tracy 的薄封装
//!
//! `tracy_client::span!` 在没有运行中的 Client 时会 panic，单元测试和 headless 运行都不会启动
//! Client，所以 crate 内部统一通过这里打点。

/// 标记一帧结束；没有 client 时什么都不做
#[inline]
pub fn frame_mark() {
    if let Some(client) = tracy_client::Client::running() {
        client.frame_mark();
    }
}

/// 返回 `Option<tracy_client::Span>`，离开作用域时结束
///
/// ```ignore
/// let _span = restir_crate_tools::profile_span!("FramePipeline::record");
/// ```
#[macro_export]
macro_rules! profile_span {
    ($name:literal) => {
        $crate::tracy_client::Client::running()
            .map(|client| client.span($crate::tracy_client::span_location!($name), 0))
    };
}
