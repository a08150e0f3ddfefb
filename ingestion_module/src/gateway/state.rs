use std::sync::Arc;

use crate::channel_registry::ChannelRegistry;
use crate::conversation::ConversationService;
use crate::idempotency::IdempotencyGuard;
use crate::store::ChatStore;

use super::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct GatewayState {
    pub store: ChatStore,
    pub conversations: ConversationService,
    pub registry: ChannelRegistry,
    pub guard: IdempotencyGuard,
    pub rate_limiter: Arc<RateLimiter>,
    /// When set, channel management endpoints require `Bearer <token>`.
    pub admin_token: Option<String>,
}

impl GatewayState {
    pub fn new(
        store: ChatStore,
        registry: ChannelRegistry,
        guard: IdempotencyGuard,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            conversations: ConversationService::new(store.clone()),
            store,
            registry,
            guard,
            rate_limiter: Arc::new(rate_limiter),
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, admin_token: Option<String>) -> Self {
        self.admin_token = admin_token;
        self
    }
}
