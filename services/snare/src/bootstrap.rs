//! Proxy bootstrapping.
//!
//! Turns each dispatchable rule into the name of the handler that services
//! it. Rules naming a built-in proxy kind get kind-specific setup first:
//!
//! | Rule name      | Effect                                              | Handler name   |
//! |----------------|-----------------------------------------------------|----------------|
//! | `proxy_tcp`    | generic relay moved from `proxy_tcp` to the target  | `rule.target`  |
//! | `proxy_ssh`    | SSH intercept proxy bound to the target             | `rule.name`    |
//! | `proxy_telnet` | Telnet intercept proxy bound to the target          | `rule.name`    |
//! | anything else  | none, the target is a handler name                  | `rule.target`  |

use std::sync::Arc;

use snare_rules::Rule;
use tracing::{debug, warn};

use crate::error::SnareError;
use crate::handlers::RELAY_HANDLER;
use crate::proxy::{InterceptProtocol, InterceptProxy};
use crate::registry::HandlerRegistryBuilder;

/// Built-in proxy category selected by a rule's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Relay,
    Intercept(InterceptProtocol),
    /// No built-in kind; the rule target names a handler directly.
    Direct,
}

impl ProxyKind {
    pub fn of(rule: &Rule) -> Self {
        match rule.name.as_str() {
            "proxy_tcp" => ProxyKind::Relay,
            "proxy_ssh" => ProxyKind::Intercept(InterceptProtocol::Ssh),
            "proxy_telnet" => ProxyKind::Intercept(InterceptProtocol::Telnet),
            _ => ProxyKind::Direct,
        }
    }
}

/// The handler name connections matched by `rule` are dispatched to.
pub fn resolve_handler_name(rule: &Rule) -> &str {
    match ProxyKind::of(rule) {
        ProxyKind::Intercept(_) => &rule.name,
        ProxyKind::Relay | ProxyKind::Direct => &rule.target,
    }
}

/// Performs per-rule proxy setup against the registry under construction.
#[derive(Debug, Clone)]
pub struct ProxyBootstrapper {
    capture_limit: usize,
}

impl ProxyBootstrapper {
    pub fn new(capture_limit: usize) -> Self {
        Self { capture_limit }
    }

    /// Set up whatever `rule` needs and return its handler name.
    ///
    /// On error nothing is registered for the rule.
    pub fn bootstrap(
        &self,
        registry: &mut HandlerRegistryBuilder,
        rule: &Rule,
    ) -> Result<String, SnareError> {
        let name = resolve_handler_name(rule).to_string();

        match ProxyKind::of(rule) {
            ProxyKind::Relay => {
                if registry.rename(RELAY_HANDLER, &name) {
                    debug!(rule = rule.index, handler = %name, "Relay handler bound to target");
                } else {
                    debug!(
                        rule = rule.index,
                        handler = %name,
                        "Generic relay already claimed by an earlier rule"
                    );
                }
            }
            ProxyKind::Intercept(protocol) => {
                let proxy = InterceptProxy::new(protocol, &rule.target, self.capture_limit)?;
                if registry.replace(name.clone(), Arc::new(proxy)).is_some() {
                    warn!(
                        rule = rule.index,
                        handler = %name,
                        "Intercept proxy replaced an earlier registration"
                    );
                }
            }
            ProxyKind::Direct => {}
        }

        Ok(name)
    }
}
