// src/processing/routing.rs
use crate::config::ProducerConfig;

/// Where the next message is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingTarget {
    /// Every message uses the same routing key.
    Fixed(String),
    /// Queue ids `1..=num_queues`, advanced once per message.
    QueueId { num_queues: usize, next_queue: usize },
}

impl RoutingTarget {
    pub fn from_config(config: &ProducerConfig) -> Self {
        if config.bind_by_id {
            RoutingTarget::QueueId {
                num_queues: config.num_queues.max(1),
                next_queue: 0,
            }
        } else {
            RoutingTarget::Fixed(config.routing_key.clone())
        }
    }

    /// Advance and return the routing key for the next message.
    pub fn advance(&mut self) -> String {
        match self {
            RoutingTarget::Fixed(key) => key.clone(),
            RoutingTarget::QueueId {
                num_queues,
                next_queue,
            } => {
                *next_queue = *next_queue % *num_queues + 1;
                next_queue.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_ids_cycle_from_one() {
        let mut target = RoutingTarget::QueueId {
            num_queues: 3,
            next_queue: 0,
        };
        let keys: Vec<String> = (0..7).map(|_| target.advance()).collect();
        assert_eq!(keys, ["1", "2", "3", "1", "2", "3", "1"]);
    }

    #[test]
    fn queue_ids_stay_in_range_from_any_offset() {
        for start in 0..=5 {
            let mut target = RoutingTarget::QueueId {
                num_queues: 5,
                next_queue: start,
            };
            for _ in 0..20 {
                let id: usize = target.advance().parse().unwrap();
                assert!((1..=5).contains(&id));
            }
        }
    }

    #[test]
    fn single_queue_always_one() {
        let mut target = RoutingTarget::QueueId {
            num_queues: 1,
            next_queue: 0,
        };
        assert_eq!(target.advance(), "1");
        assert_eq!(target.advance(), "1");
    }

    #[test]
    fn fixed_key_from_config() {
        let mut config = ProducerConfig::new("ex");
        config.routing_key = "rk".to_string();

        let mut target = RoutingTarget::from_config(&config);
        assert_eq!(target.advance(), "rk");
        assert_eq!(target.advance(), "rk");

        config.bind_by_id = true;
        config.num_queues = 2;
        assert_eq!(
            RoutingTarget::from_config(&config),
            RoutingTarget::QueueId {
                num_queues: 2,
                next_queue: 0
            }
        );
    }
}
