//! Memory access port registers.

use bitfield::bitfield;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

/// A register of an access port, addressed by its byte offset within the AP.
pub trait ApRegister: From<u32> + Into<u32> {
    const ADDRESS: u8;
    const NAME: &'static str;

    /// The full register address `(APSEL << 24) | offset` for access port `ap`.
    fn address(ap: u8) -> u32 {
        (u32::from(ap) << 24) | u32::from(Self::ADDRESS)
    }
}

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq)]
pub enum DataSize {
    U8 = 0b000,
    U16 = 0b001,
    U32 = 0b010,
}

impl Default for DataSize {
    fn default() -> Self {
        DataSize::U32
    }
}

impl DataSize {
    pub fn bytes(self) -> u32 {
        1 << (self as u32)
    }
}

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq)]
pub enum AddressIncrement {
    Off = 0b00,
    Single = 0b01,
    Packed = 0b10,
}

impl Default for AddressIncrement {
    fn default() -> Self {
        AddressIncrement::Single
    }
}

bitfield! {
    /// CSW, control and status word of a MEM-AP.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub spiden, _: 23;
    pub tr_in_prog, _: 7;
    pub device_en, set_device_en: 6;
    pub u8, addr_inc_raw, set_addr_inc_raw: 5, 4;
    pub u8, size_raw, set_size_raw: 2, 0;
}

impl Csw {
    /// Privileged data access of `size` with single auto-increment.
    pub fn for_size(size: DataSize) -> Self {
        let mut csw = Csw(0);
        csw.set_prot(0x23);
        csw.set_device_en(true);
        csw.set_addr_inc_raw(AddressIncrement::Single as u8);
        csw.set_size_raw(size as u8);
        csw
    }

    pub fn size(&self) -> Option<DataSize> {
        DataSize::from_u8(self.size_raw())
    }

    pub fn addr_inc(&self) -> Option<AddressIncrement> {
        AddressIncrement::from_u8(self.addr_inc_raw())
    }
}

impl From<u32> for Csw {
    fn from(raw: u32) -> Self {
        Csw(raw)
    }
}

impl From<Csw> for u32 {
    fn from(raw: Csw) -> Self {
        raw.0
    }
}

impl ApRegister for Csw {
    const ADDRESS: u8 = 0x00;
    const NAME: &'static str = "CSW";
}

/// TAR, the bus address of the next DRW access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tar(pub u32);

impl From<u32> for Tar {
    fn from(raw: u32) -> Self {
        Tar(raw)
    }
}

impl From<Tar> for u32 {
    fn from(raw: Tar) -> Self {
        raw.0
    }
}

impl ApRegister for Tar {
    const ADDRESS: u8 = 0x04;
    const NAME: &'static str = "TAR";
}

/// DRW, data read or written at TAR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Drw(pub u32);

impl From<u32> for Drw {
    fn from(raw: u32) -> Self {
        Drw(raw)
    }
}

impl From<Drw> for u32 {
    fn from(raw: Drw) -> Self {
        raw.0
    }
}

impl ApRegister for Drw {
    const ADDRESS: u8 = 0x0C;
    const NAME: &'static str = "DRW";
}

bitfield! {
    /// IDR, identification of the access port.
    #[derive(Clone, Copy)]
    pub struct Idr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u16, designer, _: 27, 17;
    pub u8, class, _: 16, 13;
    pub u8, variant, _: 7, 4;
    pub u8, ap_type, _: 3, 0;
}

impl From<u32> for Idr {
    fn from(raw: u32) -> Self {
        Idr(raw)
    }
}

impl From<Idr> for u32 {
    fn from(raw: Idr) -> Self {
        raw.0
    }
}

impl ApRegister for Idr {
    const ADDRESS: u8 = 0xFC;
    const NAME: &'static str = "IDR";
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn csw_values() {
        assert_eq!(u32::from(Csw::for_size(DataSize::U8)), 0x2300_0050);
        assert_eq!(u32::from(Csw::for_size(DataSize::U16)), 0x2300_0051);
        assert_eq!(u32::from(Csw::for_size(DataSize::U32)), 0x2300_0052);

        let csw = Csw::from(0x2300_0052);
        assert_eq!(csw.size(), Some(DataSize::U32));
        assert_eq!(csw.addr_inc(), Some(AddressIncrement::Single));
    }

    #[test]
    fn register_addresses() {
        assert_eq!(Csw::address(0), 0x0000_0000);
        assert_eq!(Idr::address(1), 0x0100_00FC);
    }
}
