//! Redis Lua 脚本模块
//!
//! 保证三列表协议中跨列表操作的原子性
//! Keeps the cross-list steps of the three-list protocol atomic

/// 重试脚本
/// Retry script
/// `KEYS[1]` -> `<prefix>:running`
/// `KEYS[2]` -> `<prefix>:pending`
/// `ARGV[1]` -> 当前负载 / current payload
/// `ARGV[2]` -> 重试次数加一后的负载 / payload with the retry count incremented
/// 返回值：删除的数量，0 表示负载已不在 running 中
/// Returns the number removed, 0 when the payload was no longer in running
pub const RETRY: &str = r#"
    local removed = redis.call("LREM", KEYS[1], 1, ARGV[1])
    if removed > 0 then
        redis.call("LPUSH", KEYS[2], ARGV[2])
    end
    return removed
"#;

/// 死信脚本
/// Dead-letter script
/// `KEYS[1]` -> `<prefix>:running`
/// `KEYS[2]` -> `<prefix>:dlq`
/// `ARGV[1]` -> 负载 / payload
pub const DEAD_LETTER: &str = r#"
    local removed = redis.call("LREM", KEYS[1], 1, ARGV[1])
    if removed > 0 then
        redis.call("LPUSH", KEYS[2], ARGV[1])
    end
    return removed
"#;

/// 过期任务恢复脚本，将 running 中的全部负载移回 pending
/// Stale-job recovery script, moves everything in running back to pending
/// `KEYS[1]` -> `<prefix>:running`
/// `KEYS[2]` -> `<prefix>:pending`
/// 返回值：移动的数量
/// Returns the number moved
pub const REQUEUE_STALE: &str = r#"
    local moved = 0
    while redis.call("RPOPLPUSH", KEYS[1], KEYS[2]) do
        moved = moved + 1
    end
    return moved
"#;

/// 每日配额脚本，计数加一并设置在下一个 UTC 零点过期
/// Daily quota script, increments the counter and expires it at the next UTC midnight
/// `KEYS[1]` -> `<prefix>:quota:<YYYY-MM-DD>`
/// `ARGV[1]` -> 过期时间戳（秒） / expiry unix timestamp in seconds
/// 返回值：加一后的计数
/// Returns the count after the increment
pub const CONSUME_QUOTA: &str = r#"
    local count = redis.call("INCR", KEYS[1])
    redis.call("EXPIREAT", KEYS[1], ARGV[1])
    return count
"#;
