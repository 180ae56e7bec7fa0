//! Field codecs and typed payloads for the GT06 frame kinds.
//!
//! Each payload type encodes to the byte layout the server expects and
//! decodes back, rejecting inputs whose declared lengths disagree with
//! the byte count. Clamping rules (satellite count, cell id) follow the
//! protocol rather than erroring.

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Gt06Error, Result};

/// Device login (device → server).
pub const PROTO_LOGIN: u8 = 0x01;
/// GPS location report (device → server).
pub const PROTO_LOCATION: u8 = 0x12;
/// Device status, doubling as the heart-beat (device → server).
pub const PROTO_STATUS: u8 = 0x13;
/// Device command response (device → server).
pub const PROTO_DEVICE_CMD: u8 = 0x15;
/// GPS location plus device status (device → server).
pub const PROTO_LOCATION_STATUS: u8 = 0x16;
/// Server-originated command (server → device).
pub const PROTO_SERVER_CMD: u8 = 0x80;

const IMEI_LEN: usize = 16;
const GPS_BLOCK_LEN: usize = 18;
const LBS_BLOCK_LEN: usize = 8;
const STATUS_BLOCK_LEN: usize = 5;

/// Degrees are carried as `trunc(|degrees| * 1_800_000)`; the sign
/// travels in the status/course word.
const DEGREE_SCALE: f64 = 1_800_000.0;

// High nibble of the satellite byte, the fixed "GPS information length".
const GPS_INFO_LEN: u8 = 0xC;

const LANGUAGE_ENGLISH: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Calendar timestamp of a fix, BCD encoded on the wire as
/// `YY MM DD hh mm ss`.
pub struct DateTime {
    /// Two-digit year, 0..=99.
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    pub fn validate(&self) -> Result<()> {
        if self.year > 99 {
            return Err(Gt06Error::out_of_range("year", self.year));
        }
        if self.month < 1 || self.month > 12 {
            return Err(Gt06Error::out_of_range("month", self.month));
        }
        if self.day < 1 || self.day > 31 {
            return Err(Gt06Error::out_of_range("day", self.day));
        }
        if self.hour > 23 {
            return Err(Gt06Error::out_of_range("hour", self.hour));
        }
        if self.minute > 59 {
            return Err(Gt06Error::out_of_range("minute", self.minute));
        }
        if self.second > 59 {
            return Err(Gt06Error::out_of_range("second", self.second));
        }
        Ok(())
    }

    /// Encode to six BCD bytes, one per decimal pair.
    pub fn encode(&self) -> Result<[u8; 6]> {
        self.validate()?;
        Ok([
            to_bcd(self.year),
            to_bcd(self.month),
            to_bcd(self.day),
            to_bcd(self.hour),
            to_bcd(self.minute),
            to_bcd(self.second),
        ])
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() != 6 {
            return Err(Gt06Error::BadLength {
                declared: 6,
                actual: buffer.len(),
            });
        }
        let decoded = Self {
            year: from_bcd(buffer[0], "year")?,
            month: from_bcd(buffer[1], "month")?,
            day: from_bcd(buffer[2], "day")?,
            hour: from_bcd(buffer[3], "hour")?,
            minute: from_bcd(buffer[4], "minute")?,
            second: from_bcd(buffer[5], "second")?,
        };
        decoded.validate()?;
        Ok(decoded)
    }
}

fn to_bcd(value: u8) -> u8 {
    (value / 10) << 4 | (value % 10)
}

fn from_bcd(byte: u8, field: &'static str) -> Result<u8> {
    let (high, low) = (byte >> 4, byte & 0x0F);
    if high > 9 || low > 9 {
        return Err(Gt06Error::out_of_range(field, format!("{byte:#04X}")));
    }
    Ok(high * 10 + low)
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Alarm condition carried in the device-status byte (3 bits) and again
/// as the heart-beat's additional alarm byte.
pub enum Alarm {
    #[default]
    Normal = 0,
    Vibration = 1,
    PowerOutage = 2,
    LowBattery = 3,
    Sos = 4,
}

impl Alarm {
    pub fn from_u8(val: u8) -> Result<Self> {
        match val {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Vibration),
            2 => Ok(Self::PowerOutage),
            3 => Ok(Self::LowBattery),
            4 => Ok(Self::Sos),
            val => Err(Gt06Error::out_of_range("alarm", val)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Packed operational state reported by the heart-beat and the 0x16
/// location report.
pub struct DeviceStatus {
    /// Defence (armed) state.
    pub defend: bool,
    /// ACC line high.
    pub acc: bool,
    /// Battery charging.
    pub charge: bool,
    pub alarm: Alarm,
    /// GPS has a fix.
    pub gps: bool,
    /// Oil/electricity connected.
    pub power: bool,
    /// Battery level, 0 (powered down) ..= 6 (full).
    pub voltage_level: u8,
    /// GSM signal strength, 0 (none) ..= 4 (strong).
    pub gsm_signal: u8,
}

impl DeviceStatus {
    pub fn validate(&self) -> Result<()> {
        if self.voltage_level > 6 {
            return Err(Gt06Error::out_of_range("voltage_level", self.voltage_level));
        }
        if self.gsm_signal > 4 {
            return Err(Gt06Error::out_of_range("gsm_signal", self.gsm_signal));
        }
        Ok(())
    }

    /// The packed status byte, MSB → LSB:
    /// `power | gps | alarm(3 bits) | charge | acc | defend`.
    pub fn status_byte(&self) -> u8 {
        (self.power as u8) << 7
            | (self.gps as u8) << 6
            | (self.alarm as u8) << 3
            | (self.charge as u8) << 2
            | (self.acc as u8) << 1
            | self.defend as u8
    }

    /// The five-byte device-status block of the 0x13/0x16 payloads.
    pub fn encode(&self) -> Result<[u8; 5]> {
        self.validate()?;
        Ok([
            self.status_byte(),
            self.voltage_level,
            self.gsm_signal,
            self.alarm as u8,
            LANGUAGE_ENGLISH,
        ])
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() != STATUS_BLOCK_LEN {
            return Err(Gt06Error::BadLength {
                declared: STATUS_BLOCK_LEN,
                actual: buffer.len(),
            });
        }
        let byte = buffer[0];
        // buffer[3] repeats the alarm for the server and buffer[4] is the
        // language selector; the status byte is authoritative.
        let decoded = Self {
            defend: byte & 0x01 != 0,
            acc: byte & 0x02 != 0,
            charge: byte & 0x04 != 0,
            alarm: Alarm::from_u8((byte >> 3) & 0b111)?,
            gps: byte & 0x40 != 0,
            power: byte & 0x80 != 0,
            voltage_level: buffer[1],
            gsm_signal: buffer[2],
        };
        decoded.validate()?;
        Ok(decoded)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Serving-cell identifiers appended to every location report.
pub struct LbsCell {
    /// Mobile Country Code.
    pub mcc: u16,
    /// Mobile Network Code.
    pub mnc: u8,
    /// Location Area Code.
    pub lac: u16,
    /// Cell tower id; values past 24 bits are clamped on encode.
    pub cell_id: u32,
}

impl LbsCell {
    /// `mcc(u16) | mnc(u8) | lac(u16) | cell_id(u24)`, big-endian.
    pub fn encode(&self) -> [u8; 8] {
        let cell_id = self.cell_id.min(0xFF_FFFF);
        let mut block = [0_u8; 8];
        block[..2].copy_from_slice(&self.mcc.to_be_bytes());
        block[2] = self.mnc;
        block[3..5].copy_from_slice(&self.lac.to_be_bytes());
        block[5..].copy_from_slice(&cell_id.to_be_bytes()[1..]);
        block
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() != LBS_BLOCK_LEN {
            return Err(Gt06Error::BadLength {
                declared: LBS_BLOCK_LEN,
                actual: buffer.len(),
            });
        }
        let mut reader = buffer;
        Ok(Self {
            mcc: reader.read_u16::<BigEndian>()?,
            mnc: reader.read_u8()?,
            lac: reader.read_u16::<BigEndian>()?,
            cell_id: reader.read_u24::<BigEndian>()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
/// A semantic GPS fix. Latitude and longitude are decimal degrees; the
/// hemisphere travels in the `lat_ns`/`lon_ew` flags, so the magnitudes
/// are what get encoded.
pub struct LocationFix {
    pub date_time: DateTime,
    /// Satellites in view; clamped to 15 on encode.
    pub satellite_num: u8,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h.
    pub speed: u8,
    /// Degrees, 0..=359.
    pub course: u16,
    /// false = South, true = North.
    pub lat_ns: bool,
    /// false = East, true = West.
    pub lon_ew: bool,
    /// false = no fix, true = fixed.
    pub gps_onoff: bool,
    /// false = real-time GPS, true = differential GPS.
    pub is_real_time: bool,
}

impl LocationFix {
    pub fn validate(&self) -> Result<()> {
        self.date_time.validate()?;
        if self.course > 359 {
            return Err(Gt06Error::out_of_range("course", self.course));
        }
        if !self.latitude.is_finite() || self.latitude.abs() > 90.0 {
            return Err(Gt06Error::out_of_range("latitude", self.latitude));
        }
        if !self.longitude.is_finite() || self.longitude.abs() > 180.0 {
            return Err(Gt06Error::out_of_range("longitude", self.longitude));
        }
        Ok(())
    }

    /// The 16-bit status/course word: `is_real_time` bit 15, `gps_onoff`
    /// bit 14, `lon_ew` bit 13, `lat_ns` bit 12, course in the low 10
    /// bits.
    pub fn status_course_word(&self) -> u16 {
        (self.is_real_time as u16) << 15
            | (self.gps_onoff as u16) << 14
            | (self.lon_ew as u16) << 13
            | (self.lat_ns as u16) << 12
            | (self.course & 0x3FF)
    }

    /// The 18-byte GPS block shared by the 0x12 and 0x16 payloads.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut block = Vec::with_capacity(GPS_BLOCK_LEN);
        block.extend_from_slice(&self.date_time.encode()?);
        block.push(GPS_INFO_LEN << 4 | self.satellite_num.min(15));
        block.extend_from_slice(&encode_degrees(self.latitude).to_be_bytes());
        block.extend_from_slice(&encode_degrees(self.longitude).to_be_bytes());
        block.push(self.speed);
        block.extend_from_slice(&self.status_course_word().to_be_bytes());
        Ok(block)
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() != GPS_BLOCK_LEN {
            return Err(Gt06Error::BadLength {
                declared: GPS_BLOCK_LEN,
                actual: buffer.len(),
            });
        }
        let date_time = DateTime::decode(&buffer[..6])?;
        let satellite_num = buffer[6] & 0x0F;

        let mut reader = &buffer[7..];
        let latitude = decode_degrees(reader.read_u32::<BigEndian>()?);
        let longitude = decode_degrees(reader.read_u32::<BigEndian>()?);
        let speed = reader.read_u8()?;
        let word = reader.read_u16::<BigEndian>()?;

        let decoded = Self {
            date_time,
            satellite_num,
            latitude,
            longitude,
            speed,
            course: word & 0x3FF,
            lat_ns: word & (1 << 12) != 0,
            lon_ew: word & (1 << 13) != 0,
            gps_onoff: word & (1 << 14) != 0,
            is_real_time: word & (1 << 15) != 0,
        };
        decoded.validate()?;
        Ok(decoded)
    }
}

fn encode_degrees(degrees: f64) -> u32 {
    (degrees.abs() * DEGREE_SCALE).trunc() as u32
}

fn decode_degrees(raw: u32) -> f64 {
    raw as f64 / DEGREE_SCALE
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Login payload (0x01): the device IMEI as 16 ASCII bytes, right-padded
/// with `'0'`.
pub struct Login {
    pub imei: String,
}

impl Login {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.imei.is_ascii() || self.imei.len() > IMEI_LEN {
            return Err(Gt06Error::out_of_range("imei", &self.imei));
        }
        let mut payload = self.imei.clone().into_bytes();
        payload.resize(IMEI_LEN, b'0');
        Ok(payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != IMEI_LEN {
            return Err(Gt06Error::BadLength {
                declared: IMEI_LEN,
                actual: payload.len(),
            });
        }
        Ok(Self {
            imei: ascii_string(payload, "imei")?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
/// Location report payload (0x12): the GPS block followed by the LBS
/// block.
pub struct LocationReport {
    pub fix: LocationFix,
    pub cell: LbsCell,
}

impl LocationReport {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = self.fix.encode()?;
        payload.extend_from_slice(&self.cell.encode());
        Ok(payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != GPS_BLOCK_LEN + LBS_BLOCK_LEN {
            return Err(Gt06Error::BadLength {
                declared: GPS_BLOCK_LEN + LBS_BLOCK_LEN,
                actual: payload.len(),
            });
        }
        Ok(Self {
            fix: LocationFix::decode(&payload[..GPS_BLOCK_LEN])?,
            cell: LbsCell::decode(&payload[GPS_BLOCK_LEN..])?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Heart-beat payload (0x13): the five-byte device-status block.
pub struct StatusReport {
    pub status: DeviceStatus,
}

impl StatusReport {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.status.encode()?.to_vec())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            status: DeviceStatus::decode(payload)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
/// Location + status payload (0x16): the GPS block, a one-byte LBS
/// length, the LBS block and the device-status block.
pub struct LocationStatusReport {
    pub fix: LocationFix,
    pub cell: LbsCell,
    pub status: DeviceStatus,
}

impl LocationStatusReport {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = self.fix.encode()?;
        payload.push(LBS_BLOCK_LEN as u8);
        payload.extend_from_slice(&self.cell.encode());
        payload.extend_from_slice(&self.status.encode()?);
        Ok(payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < GPS_BLOCK_LEN + 1 {
            return Err(Gt06Error::BadLength {
                declared: GPS_BLOCK_LEN + 1 + LBS_BLOCK_LEN + STATUS_BLOCK_LEN,
                actual: payload.len(),
            });
        }
        let lbs_len = payload[GPS_BLOCK_LEN] as usize;
        let declared = GPS_BLOCK_LEN + 1 + lbs_len + STATUS_BLOCK_LEN;
        if payload.len() != declared {
            return Err(Gt06Error::BadLength {
                declared,
                actual: payload.len(),
            });
        }
        let lbs_end = GPS_BLOCK_LEN + 1 + lbs_len;
        Ok(Self {
            fix: LocationFix::decode(&payload[..GPS_BLOCK_LEN])?,
            cell: LbsCell::decode(&payload[GPS_BLOCK_LEN + 1..lbs_end])?,
            status: DeviceStatus::decode(&payload[lbs_end..])?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Device command response payload (0x15):
/// `cmd_len | server_flag(u32) | cmd_data`.
pub struct CommandReport {
    /// Echoed from the server command this responds to.
    pub server_flag: u32,
    pub cmd_data: String,
}

impl CommandReport {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_command(self.server_flag, &self.cmd_data)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (server_flag, cmd_data) = decode_command(payload)?;
        Ok(Self {
            server_flag,
            cmd_data,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Server-originated command payload (0x80), same layout as 0x15.
pub struct ServerCommand {
    pub server_flag: u32,
    pub cmd_data: String,
}

impl ServerCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_command(self.server_flag, &self.cmd_data)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (server_flag, cmd_data) = decode_command(payload)?;
        Ok(Self {
            server_flag,
            cmd_data,
        })
    }
}

// The command length byte counts the server flag plus the ASCII data.
fn encode_command(server_flag: u32, cmd_data: &str) -> Result<Vec<u8>> {
    if !cmd_data.is_ascii() {
        return Err(Gt06Error::out_of_range("cmd_data", cmd_data));
    }
    let cmd_len = 4 + cmd_data.len();
    if cmd_len > 0xFF {
        return Err(Gt06Error::PayloadTooLong(cmd_data.len()));
    }

    let mut payload = Vec::with_capacity(1 + cmd_len);
    payload.push(cmd_len as u8);
    payload.extend_from_slice(&server_flag.to_be_bytes());
    payload.extend_from_slice(cmd_data.as_bytes());
    Ok(payload)
}

fn decode_command(payload: &[u8]) -> Result<(u32, String)> {
    if payload.len() < 5 || payload[0] as usize != payload.len() - 1 {
        return Err(Gt06Error::BadLength {
            declared: payload.first().map_or(5, |len| *len as usize + 1),
            actual: payload.len(),
        });
    }
    let server_flag = (&payload[1..5]).read_u32::<BigEndian>()?;
    Ok((server_flag, ascii_string(&payload[5..], "cmd_data")?))
}

fn ascii_string(bytes: &[u8], field: &'static str) -> Result<String> {
    if !bytes.is_ascii() {
        return Err(Gt06Error::out_of_range(field, format!("{bytes:02X?}")));
    }
    // Valid ASCII is valid UTF-8.
    Ok(String::from_utf8_lossy(bytes).into_owned())
}
