use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ComputeContext, ComputeError, ComputedKey};
use crate::config::{deserialize_duration, deserialize_opt_duration};

/// Expiry policy of a compute method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MethodOptions {
    /// Time after a computation at which its result is invalidated regardless of access.
    ///
    /// Accepts fractional seconds (`1.5`) or humantime strings (`1500ms`). `null` disables it.
    #[serde(deserialize_with = "deserialize_opt_duration")]
    pub auto_invalidate_time: Option<Duration>,
    /// Time an unaccessed node, consistent or invalidated, is retained before eviction.
    #[serde(deserialize_with = "deserialize_duration")]
    pub keep_alive_time: Duration,
}

impl Default for MethodOptions {
    fn default() -> Self {
        Self {
            auto_invalidate_time: None,
            keep_alive_time: Duration::from_secs(60),
        }
    }
}

pub(crate) type MethodFn =
    Arc<dyn Fn(ComputeContext) -> BoxFuture<'static, Result<Value, ComputeError>> + Send + Sync>;

pub(crate) struct RegisteredMethod {
    pub options: MethodOptions,
    pub compute: MethodFn,
}

/// Static table of compute methods, keyed by `service.method`, built once at startup.
#[derive(Default)]
pub(crate) struct MethodRegistry {
    methods: FxHashMap<String, RegisteredMethod>,
    default_options: MethodOptions,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("MethodRegistry")
            .field("methods", &methods)
            .field("default_options", &self.default_options)
            .finish()
    }
}

impl MethodRegistry {
    pub fn new(default_options: MethodOptions) -> Self {
        Self {
            methods: FxHashMap::default(),
            default_options,
        }
    }

    pub fn insert(&mut self, method_id: String, method: RegisteredMethod) {
        if self.methods.insert(method_id.clone(), method).is_some() {
            tracing::warn!("Compute method {} registered twice", method_id);
        }
    }

    /// Applies configured option overrides to registered methods.
    ///
    /// Overrides for methods that are not registered are still kept, as they apply to ad-hoc
    /// computations with a matching key.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, MethodOptions>) {
        for (method_id, options) in overrides {
            match self.methods.get_mut(method_id) {
                Some(method) => method.options = *options,
                None => {
                    tracing::debug!("Configured options for unregistered method {}", method_id);
                }
            }
        }
    }

    pub fn get(&self, key: &ComputedKey) -> Option<&RegisteredMethod> {
        self.methods.get(&key.method_id())
    }

    pub fn options_for(
        &self,
        key: &ComputedKey,
        overrides: &BTreeMap<String, MethodOptions>,
    ) -> MethodOptions {
        let method_id = key.method_id();
        if let Some(method) = self.methods.get(&method_id) {
            return method.options;
        }
        overrides
            .get(&method_id)
            .copied()
            .unwrap_or(self.default_options)
    }
}

/// Wraps a typed compute function into the type-erased form stored in the registry.
pub(crate) fn erase<A, T, F, Fut>(compute: F) -> MethodFn
where
    A: DeserializeOwned + Send + 'static,
    T: Serialize + Send + 'static,
    F: Fn(ComputeContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ComputeError>> + Send + 'static,
{
    Arc::new(move |ctx: ComputeContext| {
        let args = ctx.key().args::<A>();
        let future = args.map(|args| compute(ctx, args));
        async move {
            let value = future?.await?;
            Ok(serde_json::to_value(value)?)
        }
        .boxed()
    })
}
