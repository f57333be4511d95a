use uuid::Uuid;

/**
 * How long (milliseconds) a scan window lasts unless the caller asks for something else.
 */
pub const SCAN_WINDOW: u64 = 10_000;

/**
 * How long (milliseconds) establishing the link, and separately discovering its services, may take.
 */
pub const CONNECT_DEADLINE: u64 = 10_000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 * BLE writes can hang silently, so this is always enforced.
 */
pub const WRITE_DEADLINE: u64 = 5_000;

/**
 * How long (milliseconds) the transport gets to acknowledge a disconnect.
 * The native handle is released either way.
 */
pub const DISCONNECT_DEADLINE: u64 = 2_000;

/**
 * How long (milliseconds) connecting by id may scan for a peripheral the adapter has not seen yet.
 * Stays below CONNECT_DEADLINE so the lookup scan is always stopped.
 */
pub const LOOKUP_WINDOW: u64 = 5_000;

/**
 * Advertised local name of the fan controller. Matched exactly, case-sensitive.
 */
pub const TARGET_NAME: &str = "WindTrax";

/**
 * The UUID of the Bluetooth BLE service of the fan controller
 */
pub const FAN_SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic to send fan commands to.
 */
pub const FAN_COMMAND_CHARACTERISTIC: Uuid = Uuid::from_u128(0xabcdef01_1234_5678_1234_56789abcdef0);

pub const TRIGGER_ON: [u8; 1] = [0x31]; // 1
pub const TRIGGER_OFF: [u8; 1] = [0x30]; // 0

/**
 * Speed presets (percentage) offered by the front end.
 */
pub const SPEED_LOW: u8 = 33;
pub const SPEED_MEDIUM: u8 = 66;
pub const SPEED_HIGH: u8 = 100;
