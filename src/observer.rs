use std::net::SocketAddr;
use std::sync::Arc;

use service::{Authenticator, OperationContext};

use crate::config::Config;
use crate::statistics::Statistics;

/// The policy seam a running peer plugs into `netmirror-service`'s
/// dispatcher: admits peers per `auth.allow-peers`, denies attribute and
/// item-key prefixes per `auth.deny-prefixes`, and records every decision to
/// `Statistics`.
#[derive(Clone)]
pub struct Observer {
    config: Arc<Config>,
    statistics: Statistics,
}

impl Observer {
    pub fn new(config: Arc<Config>, statistics: Statistics) -> Self {
        Self { config, statistics }
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }
}

impl Authenticator for Observer {
    fn admit_peer(&self, endpoint: SocketAddr) -> bool {
        let admitted = self.config.auth.allow_peers.is_empty()
            || self.config.auth.allow_peers.contains(&endpoint);

        if !admitted {
            log::warn!("netmirror: rejected peer not in allow-list: {endpoint}");
        }

        self.statistics.record_admit(endpoint, admitted);
        admitted
    }

    fn permit(&self, ctx: &OperationContext<'_>) -> bool {
        let allowed = match ctx.attr_name {
            Some(name) => !self
                .config
                .auth
                .deny_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str())),
            None => true,
        };

        if !allowed {
            log::debug!(
                "netmirror: denied {:?} on target={} attr={:?} from peer={}",
                ctx.opcode,
                ctx.target_id,
                ctx.attr_name,
                ctx.peer,
            );
        }

        self.statistics.record_permit(ctx.peer, allowed);
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service::Opcode;

    #[test]
    fn empty_allow_list_admits_everyone() {
        let observer = Observer::new(Arc::new(Config::default()), Statistics::default());
        assert!(observer.admit_peer("127.0.0.1:1".parse().unwrap()));
    }

    #[test]
    fn nonempty_allow_list_rejects_unlisted_peers() {
        let mut config = Config::default();
        config.auth.allow_peers = vec!["127.0.0.1:1".parse().unwrap()];
        let observer = Observer::new(Arc::new(config), Statistics::default());
        assert!(observer.admit_peer("127.0.0.1:1".parse().unwrap()));
        assert!(!observer.admit_peer("127.0.0.1:2".parse().unwrap()));
    }

    #[test]
    fn underscore_attrs_denied_by_default_prefix_list() {
        let observer = Observer::new(Arc::new(Config::default()), Statistics::default());
        let ctx = OperationContext {
            opcode: Opcode::GetAttr,
            peer: "127.0.0.1:1".parse().unwrap(),
            target_id: 1,
            attr_name: Some("_secret"),
        };
        assert!(!observer.permit(&ctx));
    }
}
