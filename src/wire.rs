use std::io::{Read, Write};

use crate::Result;

pub(crate) fn write_u8(dst: &mut dyn Write, value: u8) -> Result<()> {
    dst.write_all(&[value])?;
    Ok(())
}

pub(crate) fn write_u16(dst: &mut dyn Write, value: u16) -> Result<()> {
    dst.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_u32(dst: &mut dyn Write, value: u32) -> Result<()> {
    dst.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_i64(dst: &mut dyn Write, value: i64) -> Result<()> {
    dst.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_u8(src: &mut dyn Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    src.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u16(src: &mut dyn Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    src.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u32(src: &mut dyn Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    src.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_i64(src: &mut dyn Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    src.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}
