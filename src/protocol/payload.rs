//! Operation specific payload codecs. All multi-byte numbers are little
//!  endian on this wire, matching the endpoint's native layout.

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum KeyAction {
    Released = 0x00,
    Pressed = 0x01,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PeripheralState {
    Uninitialized = 0x01,
    Available = 0x02,
    Occupied = 0x03,
}

/// The kind of a peripheral behind the endpoint. `Root` is the endpoint
///  itself, which always occupies address 0.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Peripheral {
    Root = 0x00,
    Ir = 0x20,
    Ble = 0x40,
}

/// payload of a KEY request, and of key events originating on the endpoint
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KeyEvent {
    pub action: KeyAction,
    pub code: u16,
}
impl KeyEvent {
    pub const WIRE_SIZE: usize = 3;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.action.into());
        buf.put_u16_le(self.code);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<KeyEvent> {
        let action = KeyAction::try_from(buf.try_get_u8()?)?;
        let code = buf.try_get_u16_le()?;
        Ok(KeyEvent { action, code })
    }
}

/// SETTINGS payload for a BLE keyboard peripheral: USB identity plus the
///  advertised device name, which runs to the end of the payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BleSettings {
    pub vid: u16,
    pub pid: u16,
    pub name: String,
}
impl BleSettings {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.vid);
        buf.put_u16_le(self.pid);
        buf.put_slice(self.name.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<BleSettings> {
        let vid = buf.try_get_u16_le()?;
        let pid = buf.try_get_u16_le()?;
        let mut name = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut name);
        Ok(BleSettings {
            vid,
            pid,
            name: String::from_utf8(name)?,
        })
    }
}

/// SETTINGS payload for an IR transmitter peripheral
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IrSettings {
    pub carrier_hz: u16,
}
impl IrSettings {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.carrier_hz);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<IrSettings> {
        Ok(IrSettings {
            carrier_hz: buf.try_get_u16_le()?,
        })
    }
}

/// one record of a STATE report: a peripheral the endpoint knows about
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Device {
    pub address: u8,
    pub state: PeripheralState,
    pub peripheral: Peripheral,
}
impl Device {
    pub const WIRE_SIZE: usize = 3;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.address);
        buf.put_u8(self.state.into());
        buf.put_u8(self.peripheral.into());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Device> {
        let address = buf.try_get_u8()?;
        let state = PeripheralState::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("device {:#04x}: {}", address, e))?;
        let peripheral = Peripheral::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("device {:#04x}: {}", address, e))?;
        Ok(Device {
            address,
            state,
            peripheral,
        })
    }
}

/// Iterates the device records of a STATE response payload. A record is only
///  read while the cursor is inside the declared payload; a trailing partial
///  record is reported as an error rather than silently dropped.
pub struct DeviceReader<'a> {
    buf: &'a [u8],
}
impl<'a> DeviceReader<'a> {
    pub fn new(payload: &'a [u8]) -> DeviceReader<'a> {
        DeviceReader { buf: payload }
    }
}
impl Iterator for DeviceReader<'_> {
    type Item = anyhow::Result<Device>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < Device::WIRE_SIZE {
            let trailing = self.buf.len();
            self.buf = &[];
            return Some(Err(anyhow!(
                "{} trailing bytes do not form a device record",
                trailing
            )));
        }
        Some(Device::try_deser(&mut self.buf))
    }
}
