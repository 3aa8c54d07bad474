//! The compute methods served by this binary.

use computed_service::config::Config;
use computed_service::ComputeService;

mod time;

/// Creates the compute service with every registered method.
///
/// Must be called from within a tokio runtime.
pub fn create_service(config: &Config) -> ComputeService {
    let builder = ComputeService::builder(&config.cache).method_options(config.methods.clone());
    time::register(builder).build()
}
