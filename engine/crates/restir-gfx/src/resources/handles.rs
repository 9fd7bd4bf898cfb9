use slotmap::new_key_type;

new_key_type! {
    /// 指向 [`GfxResourceManager`](super::resource_manager::GfxResourceManager) 中的 image
    ///
    /// 带代际信息：image 被销毁后旧 handle 查询不到任何东西，不会指向新分配的 image
    pub struct GfxImageHandle;

    pub struct GfxBufferHandle;
}
