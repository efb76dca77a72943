//! Domain events
//! 成员关系和订阅变更后发布，订阅方（席位自动分配等）异步处理

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// 领域事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrganizationMemberAdded {
        organization_id: Uuid,
        user_id: String,
        role: String,
    },
    OrganizationMemberRemoved {
        organization_id: Uuid,
        user_id: String,
    },
    GroupMemberAdded {
        group_id: Uuid,
        user_id: String,
        role: String,
    },
    GroupMemberRemoved {
        group_id: Uuid,
        user_id: String,
    },
    /// 计划变更、取消、恢复
    SubscriptionChanged {
        user_id: String,
        subscription_id: Uuid,
        status: String,
    },
    LicenseAssigned {
        batch_id: Uuid,
        user_id: String,
    },
    LicenseRevoked {
        batch_id: Uuid,
        user_id: String,
    },
}

impl DomainEvent {
    /// 事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrganizationMemberAdded { .. } => "organization_member_added",
            DomainEvent::OrganizationMemberRemoved { .. } => "organization_member_removed",
            DomainEvent::GroupMemberAdded { .. } => "group_member_added",
            DomainEvent::GroupMemberRemoved { .. } => "group_member_removed",
            DomainEvent::SubscriptionChanged { .. } => "subscription_changed",
            DomainEvent::LicenseAssigned { .. } => "license_assigned",
            DomainEvent::LicenseRevoked { .. } => "license_revoked",
        }
    }
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件，返回接收者数量；没有订阅者时事件被丢弃
    pub fn publish(&self, event: DomainEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::debug!(event_type, "No subscribers for domain event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let event = DomainEvent::LicenseAssigned {
            batch_id: Uuid::new_v4(),
            user_id: "u2".into(),
        };
        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        let sent = bus.publish(DomainEvent::GroupMemberRemoved {
            group_id: Uuid::new_v4(),
            user_id: "u".into(),
        });
        assert_eq!(sent, 0);
    }
}
