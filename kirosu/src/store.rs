#[doc(inline)]
pub use kirosu_core::store::TaskStore;
