//! Store key scheme.
//!
//! Every key lives under the fixed `mq:` prefix:
//!
//! | key                     | type       | contents                             |
//! |-------------------------|------------|--------------------------------------|
//! | `mq:msg:{id}`           | hash       | message record fields                |
//! | `mq:queue:{queue}`      | list       | available ids, newest on the left    |
//! | `mq:processing:{queue}` | list       | in-flight ids                        |
//! | `mq:visibility`         | sorted set | `{queue}:{id}` scored by lease expiry |
//! | `mq:queues`             | sorted set | queue names scored by last push      |

const PREFIX: &str = "mq";

/// Expiry index shared by every queue.
pub const VISIBILITY: &str = "mq:visibility";

/// Registry of queue names that have ever received a message.
pub const QUEUES: &str = "mq:queues";

pub fn message(id: &str) -> String {
    format!("{PREFIX}:msg:{id}")
}

pub fn available(queue: &str) -> String {
    format!("{PREFIX}:queue:{queue}")
}

pub fn in_flight(queue: &str) -> String {
    format!("{PREFIX}:processing:{queue}")
}

/// Member of the expiry index for a leased message.
pub fn expiry_member(queue: &str, id: &str) -> String {
    format!("{queue}:{id}")
}

/// Split an expiry index member back into `(queue, id)`.
///
/// Ids never contain `:`, so the last separator is the boundary even when the
/// queue name has colons of its own.
pub fn parse_expiry_member(member: &str) -> Option<(&str, &str)> {
    member
        .rsplit_once(':')
        .filter(|(queue, id)| !queue.is_empty() && !id.is_empty())
}
