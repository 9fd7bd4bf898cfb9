use slotmap::new_key_type;

new_key_type! {
    pub struct MaterialHandle;
    pub struct MeshHandle;
    pub struct InstanceHandle;
}
