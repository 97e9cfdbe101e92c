pub mod icons;
pub mod run_view;

pub use run_view::{RunView, UiMode};
