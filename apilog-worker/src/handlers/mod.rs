mod app;

pub use app::app;
