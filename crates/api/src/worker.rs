use std::sync::Arc;
use std::time::Instant;

use konform_core::{ActualResource, ErrorClass};
use metrics::{counter, histogram};
use tracing::{debug, error, warn};

use crate::engine::Engine;

pub(crate) async fn run(engine: Arc<Engine>, worker: usize) {
    debug!(worker, "worker started");
    while let Some(item) = engine.queue().get().await {
        process(&engine, &item).await;
        engine.queue().done(&item);
    }
    debug!(worker, "worker stopped");
}

async fn process(engine: &Engine, item: &ActualResource) {
    let key = match item.key() {
        Ok(k) => k,
        Err(e) => {
            warn!(error = %e, "queued observation without identity");
            return;
        }
    };
    let t0 = Instant::now();
    let res = engine.remediate(&key, item.current()).await;
    histogram!("remediate_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match res {
        Ok(_) => engine.queue().forget(item),
        Err(e) if e.is_retriable() => {
            let requeues = engine.queue().num_requeues(item);
            warn!(key = %key, error = %e, requeues, "remediation failed; retrying");
            counter!("remediate_errors_total", 1u64, "class" => "transient");
            engine.queue().retry(item);
        }
        Err(e) => {
            let class = e.class();
            match class {
                ErrorClass::Internal => error!(key = %key, error = %e, "remediation failed"),
                _ => warn!(key = %key, error = %e, class = %class, "remediation needs a declarative fix"),
            }
            counter!("remediate_errors_total", 1u64, "class" => class.to_string());
            engine.queue().forget(item);
        }
    }
}
