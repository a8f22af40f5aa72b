use core::fmt;

pub const CONFIG_MAGIC: [u8; 4] = *b"AZ31";

pub const DEVICE_ID_LEN: usize = 32;
pub const MODEL_LEN: usize = 16;
pub const LOCATION_LEN: usize = 32;
pub const SSID_LEN: usize = 32;
pub const PASSWORD_LEN: usize = 64;
pub const BROKER_HOST_LEN: usize = 64;
pub const TOPIC_LEN: usize = 64;

/// Size of the persisted record: every field below plus checksum and padding.
pub const RECORD_LEN: usize = 316;
pub const CHECKSUM_OFFSET: usize = 312;
pub const PADDING_OFFSET: usize = 313;

pub const DEFAULT_BROKER_PORT: u32 = 1883;
pub const DEFAULT_TOPIC: &str = "sensors/az3166";

/// One checksummed field of the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordField {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

const fn field(name: &'static str, offset: usize, width: usize) -> RecordField {
    RecordField {
        name,
        offset,
        width,
    }
}

/// Checksummed fields in declaration order. Checksum and padding are excluded.
pub const RECORD_LAYOUT: [RecordField; 9] = [
    field("magic", 0, 4),
    field("device_id", 4, DEVICE_ID_LEN),
    field("model", 36, MODEL_LEN),
    field("location", 52, LOCATION_LEN),
    field("wifi_ssid", 84, SSID_LEN),
    field("wifi_password", 116, PASSWORD_LEN),
    field("broker_host", 180, BROKER_HOST_LEN),
    field("broker_port", 244, 4),
    field("topic", 248, TOPIC_LEN),
];

/// XOR fold over the checksummed fields of an encoded record.
pub fn record_checksum(record: &[u8; RECORD_LEN]) -> u8 {
    RECORD_LAYOUT
        .iter()
        .flat_map(|field| &record[field.offset..field.offset + field.width])
        .fold(0_u8, |acc, byte| acc ^ byte)
}

/// NUL-terminated text field with a fixed on-flash width.
///
/// At most `N - 1` bytes of text are kept so the field always ends in NUL.
/// Bytes after the terminator are zeroed on every assignment.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FixedStr<N> {
    pub const fn empty() -> Self {
        Self { bytes: [0; N] }
    }

    pub fn new(text: &str) -> Self {
        let mut value = Self::empty();
        value.set(text);
        value
    }

    pub fn from_raw(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    /// Replaces the contents, truncating on a char boundary when `text` does not fit.
    /// Returns `false` when truncation happened.
    pub fn set(&mut self, text: &str) -> bool {
        let mut end = text.len().min(N.saturating_sub(1));
        while !text.is_char_boundary(end) {
            end -= 1;
        }

        self.bytes = [0; N];
        self.bytes[..end].copy_from_slice(&text.as_bytes()[..end]);
        end == text.len()
    }

    pub fn as_str(&self) -> &str {
        let len = self.bytes.iter().position(|&b| b == 0).unwrap_or(N);
        let text = &self.bytes[..len];
        match core::str::from_utf8(text) {
            Ok(value) => value,
            Err(err) => core::str::from_utf8(&text[..err.valid_up_to()]).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }

    pub fn raw(&self) -> &[u8; N] {
        &self.bytes
    }

    pub const fn capacity() -> usize {
        N
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted device settings record.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub magic: [u8; 4],
    pub device_id: FixedStr<DEVICE_ID_LEN>,
    pub model: FixedStr<MODEL_LEN>,
    pub location: FixedStr<LOCATION_LEN>,
    pub wifi_ssid: FixedStr<SSID_LEN>,
    pub wifi_password: FixedStr<PASSWORD_LEN>,
    pub broker_host: FixedStr<BROKER_HOST_LEN>,
    pub broker_port: u32,
    pub topic: FixedStr<TOPIC_LEN>,
    pub checksum: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            magic: CONFIG_MAGIC,
            device_id: FixedStr::new("SensorStation_01"),
            model: FixedStr::new("AZ3166"),
            location: FixedStr::new("unknown"),
            wifi_ssid: FixedStr::new("YourWiFiNetwork"),
            wifi_password: FixedStr::new("YourWiFiPassword"),
            broker_host: FixedStr::new("mqtt.example.com"),
            broker_port: DEFAULT_BROKER_PORT,
            topic: FixedStr::new(DEFAULT_TOPIC),
            checksum: 0,
        }
        .sealed()
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("magic", &self.magic)
            .field("device_id", &self.device_id)
            .field("model", &self.model)
            .field("location", &self.location)
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password_set", &!self.wifi_password.is_empty())
            .field("broker_host", &self.broker_host)
            .field("broker_port", &self.broker_port)
            .field("topic", &self.topic)
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl DeviceConfig {
    /// All-zero record carrying only the magic tag.
    pub fn blank() -> Self {
        Self {
            magic: CONFIG_MAGIC,
            device_id: FixedStr::empty(),
            model: FixedStr::empty(),
            location: FixedStr::empty(),
            wifi_ssid: FixedStr::empty(),
            wifi_password: FixedStr::empty(),
            broker_host: FixedStr::empty(),
            broker_port: 0,
            topic: FixedStr::empty(),
            checksum: 0,
        }
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == CONFIG_MAGIC
    }

    pub fn compute_checksum(&self) -> u8 {
        record_checksum(&self.encode())
    }

    /// Stamps the magic tag and recomputes the checksum.
    pub fn seal(&mut self) {
        self.magic = CONFIG_MAGIC;
        self.checksum = self.compute_checksum();
    }

    pub fn sealed(mut self) -> Self {
        self.seal();
        self
    }

    pub fn sanitize(&mut self) {
        if self.broker_port == 0 || self.broker_port > u32::from(u16::MAX) {
            self.broker_port = DEFAULT_BROKER_PORT;
        }
    }

    /// Port in socket form; out-of-range values fall back to the default port.
    pub fn broker_port_u16(&self) -> u16 {
        u16::try_from(self.broker_port)
            .ok()
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_BROKER_PORT as u16)
    }

    /// Encodes the record with its stored checksum and zeroed padding.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut record = [0_u8; RECORD_LEN];
        let [magic, device_id, model, location, ssid, password, host, port, topic] =
            RECORD_LAYOUT;

        put(&mut record, magic, &self.magic);
        put(&mut record, device_id, self.device_id.raw());
        put(&mut record, model, self.model.raw());
        put(&mut record, location, self.location.raw());
        put(&mut record, ssid, self.wifi_ssid.raw());
        put(&mut record, password, self.wifi_password.raw());
        put(&mut record, host, self.broker_host.raw());
        put(&mut record, port, &self.broker_port.to_le_bytes());
        put(&mut record, topic, self.topic.raw());
        record[CHECKSUM_OFFSET] = self.checksum;
        record
    }

    pub fn decode(record: &[u8; RECORD_LEN]) -> Self {
        let [magic, device_id, model, location, ssid, password, host, port, topic] =
            RECORD_LAYOUT;

        Self {
            magic: take(record, magic),
            device_id: FixedStr::from_raw(take(record, device_id)),
            model: FixedStr::from_raw(take(record, model)),
            location: FixedStr::from_raw(take(record, location)),
            wifi_ssid: FixedStr::from_raw(take(record, ssid)),
            wifi_password: FixedStr::from_raw(take(record, password)),
            broker_host: FixedStr::from_raw(take(record, host)),
            broker_port: u32::from_le_bytes(take(record, port)),
            topic: FixedStr::from_raw(take(record, topic)),
            checksum: record[CHECKSUM_OFFSET],
        }
    }
}

fn put(record: &mut [u8; RECORD_LEN], field: RecordField, bytes: &[u8]) {
    debug_assert_eq!(bytes.len(), field.width, "field {} width", field.name);
    record[field.offset..field.offset + field.width].copy_from_slice(bytes);
}

fn take<const W: usize>(record: &[u8; RECORD_LEN], field: RecordField) -> [u8; W] {
    let mut out = [0_u8; W];
    out.copy_from_slice(&record[field.offset..field.offset + W]);
    out
}
