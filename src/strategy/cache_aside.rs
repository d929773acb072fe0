// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside: check the cache, fetch on miss, fill with a jittered TTL.

use std::sync::Arc;

use async_trait::async_trait;

use super::{fetch_origin, served, Lookup, OriginFetch, ReadOptions, ReadPolicy, ReadStrategy, StrategyContext};
use crate::error::CacheError;
use crate::metrics;

pub struct CacheAside {
    ctx: Arc<StrategyContext>,
}

impl CacheAside {
    pub fn new(ctx: Arc<StrategyContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReadPolicy for CacheAside {
    fn kind(&self) -> ReadStrategy {
        ReadStrategy::CacheAside
    }

    async fn get(
        &self,
        key: &str,
        options: &ReadOptions,
        fetch: OriginFetch,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let kind = self.kind();
        match self.ctx.lookup(kind, key).await {
            Lookup::Hit(entry) => return Ok(served(kind, entry)),
            // Cluster is down: serve from origin, don't try to fill
            Lookup::Unavailable => return fetch_origin(kind, &fetch, self.ctx.origin_timeout).await,
            Lookup::Stale(_) | Lookup::Miss => metrics::record_read(kind.as_str(), "miss"),
        }

        let value = fetch_origin(kind, &fetch, self.ctx.origin_timeout).await?;
        if let Some(value) = &value {
            self.ctx.fill(key, value.clone(), options.ttl).await;
        }
        Ok(value)
    }
}
