use uuid::Uuid;

/**
 * The advertised local name of the watch.
 */
pub const DEVICE_NAME: &str = "Gecko";

/**
 * How many failed connect attempts are retried before giving up.
 */
pub const MAX_CONNECTION_ATTEMPTS: u32 = 5;

/**
 * The MTU (bytes) requested after service discovery. Whatever the peripheral grants is accepted.
 */
pub const TARGET_MTU: u16 = 517;

/**
 * How many events may be buffered for a single subscriber (and in the dispatcher queue).
 */
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/**
 * How many commands may be queued for the connection task.
 */
pub const COMMAND_CHANNEL_CAPACITY: usize = 32;

/**
 * How long (milliseconds) to wait between sticky reconnect attempts.
 */
pub const CONNECT_DELAY: u64 = 1000;

/**
 * How often (milliseconds) to check if the peripheral is still connected.
 */
pub const LINK_POLL_DELAY: u64 = 500;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * The UUID of the SmartWatchService, the only GATT service of the watch.
 */
pub const SMART_WATCH_SERVICE: Uuid = Uuid::from_u128(0x1f96e240_7e6e_452c_ab50_3e0feb504976);

/**
 * Notification characteristic (write): `app:title:body:timestamp`.
 */
pub const NOTIFICATION_CHARACTERISTIC: Uuid = Uuid::from_u128(0x1f96e241_7e6e_452c_ab50_3e0feb504976);

/**
 * Battery level characteristic (read): little-endian f32 voltage.
 */
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x1f96e242_7e6e_452c_ab50_3e0feb504976);

/**
 * Time update characteristic (write): big-endian i64 local epoch seconds.
 */
pub const UPDATE_WATCH_TIME_CHARACTERISTIC: Uuid = Uuid::from_u128(0x1f96e243_7e6e_452c_ab50_3e0feb504976);
