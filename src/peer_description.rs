use std::net::Ipv4Addr;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use crc::Crc;
use num_enum::{FromPrimitive, IntoPrimitive};
use crate::endpoint::Endpoint;
use crate::net_config::{NetConfig, NetworkRole, TransportSpec, TransportType};
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// magic zero, total size, checksum, role, interface count, transport count, service count
pub const HEADER_SIZE: usize = 7 * 4;
pub const GENERAL_INFO_SIZE: usize = 228;
pub const IF_ADDRESS_SIZE: usize = 16;
pub const TRANSPORT_SIZE: usize = 12;
pub const SERVICE_SIZE: usize = 4;

const PLATFORM_STRING_WIDTH: usize = 32;
const VERSION_WIDTH: usize = 16;
const MANUFACTURER_WIDTH: usize = 32;
const MODEL_WIDTH: usize = 32;
const UDID_WIDTH: usize = 44;
const DEVICE_NAME_WIDTH: usize = 32;
const APP_NAME_WIDTH: usize = 32;

const _: () = assert!(
    2*4 + PLATFORM_STRING_WIDTH + VERSION_WIDTH + MANUFACTURER_WIDTH + MODEL_WIDTH + UDID_WIDTH + DEVICE_NAME_WIDTH + APP_NAME_WIDTH
        == GENERAL_INFO_SIZE
);

/// the app name is the last field of the general info block
const APP_NAME_OFFSET: usize = HEADER_SIZE + GENERAL_INFO_SIZE - APP_NAME_WIDTH;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Platform {
    Windows = 0,
    MacOs = 1,
    Ios = 2,
    Android = 3,
    Linux = 4,
    #[num_enum(default)]
    Unknown = u32::MAX,
}

impl Platform {
    pub fn current() -> Platform {
        if cfg!(target_os = "windows") {
            Platform::Windows
        }
        else if cfg!(target_os = "macos") {
            Platform::MacOs
        }
        else if cfg!(target_os = "ios") {
            Platform::Ios
        }
        else if cfg!(target_os = "android") {
            Platform::Android
        }
        else if cfg!(target_os = "linux") {
            Platform::Linux
        }
        else {
            Platform::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum GpuFamily {
    PowerVrIos = 0,
    PowerVrAndroid = 1,
    Tegra = 2,
    Mali = 3,
    Adreno = 4,
    Dx11 = 5,
    #[num_enum(default)]
    Unknown = u32::MAX,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IfAddress {
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub mac: [u8; 6],
    pub is_internal: bool,
}

impl IfAddress {
    const FLAG_INTERNAL: u16 = 1;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.address.octets());
        buf.put_slice(&self.mask.octets());
        buf.put_slice(&self.mac);
        buf.put_u16_le(if self.is_internal { Self::FLAG_INTERNAL } else { 0 });
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<IfAddress> {
        let address = Ipv4Addr::from(buf.try_get_array::<4>()?);
        let mask = Ipv4Addr::from(buf.try_get_array::<4>()?);
        let mac = buf.try_get_array::<6>()?;
        let flags = buf.try_get_u16_le()?;
        Ok(IfAddress {
            address,
            mask,
            mac,
            is_internal: flags & Self::FLAG_INTERNAL != 0,
        })
    }
}

/// A peer's identity and network setup, as announced to other peers.
///
/// The serialized form is a header followed by a fixed-size general info block and then the
///  interfaces, transports and services, in this order. All integers are little endian, IPv4
///  addresses are in network byte order. String fields have a fixed width and are zero padded;
///  longer strings are truncated so the field's last byte is always zero.
///
/// The header's checksum is a CRC-32 over everything after the header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerDescription {
    pub platform: Platform,
    pub gpu_family: GpuFamily,
    pub platform_string: String,
    pub version: String,
    pub manufacturer: String,
    pub model: String,
    pub udid: String,
    pub device_name: String,
    pub app_name: String,
    pub if_addresses: Vec<IfAddress>,
    pub net_config: NetConfig,
}

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

struct Header {
    total_size: usize,
    checksum: u32,
    role: NetworkRole,
    if_count: usize,
    transport_count: usize,
    service_count: usize,
}

impl Header {
    fn deser(src: &[u8]) -> anyhow::Result<Header> {
        let mut buf = src;
        if buf.try_get_u32_le()? != 0 {
            bail!("peer description does not start with magic zero");
        }
        let total_size: usize = buf.try_get_u32_le()?.safe_cast();
        let checksum = buf.try_get_u32_le()?;
        let raw_role = buf.try_get_u32_le()?;
        let if_count: usize = buf.try_get_u32_le()?.safe_cast();
        let transport_count: usize = buf.try_get_u32_le()?.safe_cast();
        let service_count: usize = buf.try_get_u32_le()?.safe_cast();

        if total_size > src.len() {
            bail!("peer description declares {} bytes, only {} available", total_size, src.len());
        }
        let expected_size = if_count.checked_mul(IF_ADDRESS_SIZE)
            .zip(transport_count.checked_mul(TRANSPORT_SIZE))
            .zip(service_count.checked_mul(SERVICE_SIZE))
            .and_then(|((a, b), c)| (HEADER_SIZE + GENERAL_INFO_SIZE).checked_add(a)?.checked_add(b)?.checked_add(c));
        if expected_size != Some(total_size) {
            bail!("peer description declares {} bytes, its counts require {:?}", total_size, expected_size);
        }
        let role = NetworkRole::try_from(raw_role)
            .map_err(|_| anyhow!("invalid network role {}", raw_role))?;

        Ok(Header {
            total_size,
            checksum,
            role,
            if_count,
            transport_count,
            service_count,
        })
    }
}

impl PeerDescription {
    /// a description of this process, with identity information gathered from the host
    pub fn new(app_name: &str, net_config: NetConfig) -> PeerDescription {
        let device_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        PeerDescription {
            platform: Platform::current(),
            gpu_family: GpuFamily::Unknown,
            platform_string: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            manufacturer: String::new(),
            model: std::env::consts::ARCH.to_string(),
            udid: String::new(),
            device_name,
            app_name: app_name.to_string(),
            if_addresses: Vec::new(),
            net_config,
        }
    }

    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + GENERAL_INFO_SIZE
            + self.if_addresses.len() * IF_ADDRESS_SIZE
            + self.net_config.transports.len() * TRANSPORT_SIZE
            + self.net_config.services.len() * SERVICE_SIZE
    }

    /// Returns the number of bytes written, or 0 without writing anything if `dst` is too small.
    pub fn serialize(&self, dst: &mut [u8]) -> usize {
        let size = self.serialized_size();
        if dst.len() < size {
            return 0;
        }

        {
            let mut body = &mut dst[HEADER_SIZE..size];
            self.ser_general_info(&mut body);
            for if_address in &self.if_addresses {
                if_address.ser(&mut body);
            }
            for transport in &self.net_config.transports {
                body.put_u32_le(transport.transport_type.into());
                body.put_slice(&transport.endpoint.address.octets());
                body.put_u32_le(transport.endpoint.port.into());
            }
            for &service in &self.net_config.services {
                body.put_u32_le(service);
            }
            debug_assert!(body.is_empty());
        }

        let checksum = CHECKSUM.checksum(&dst[HEADER_SIZE..size]);

        let mut header = &mut dst[..HEADER_SIZE];
        header.put_u32_le(0);
        header.put_u32_le(size.prechecked_cast());
        header.put_u32_le(checksum);
        header.put_u32_le(self.net_config.role.into());
        header.put_u32_le(self.if_addresses.len().prechecked_cast());
        header.put_u32_le(self.net_config.transports.len().prechecked_cast());
        header.put_u32_le(self.net_config.services.len().prechecked_cast());
        size
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = vec![0; self.serialized_size()];
        let size = self.serialize(&mut result);
        debug_assert_eq!(size, result.len());
        result
    }

    fn ser_general_info(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.platform.into());
        buf.put_u32_le(self.gpu_family.into());
        buf.put_fixed_str(&self.platform_string, PLATFORM_STRING_WIDTH);
        buf.put_fixed_str(&self.version, VERSION_WIDTH);
        buf.put_fixed_str(&self.manufacturer, MANUFACTURER_WIDTH);
        buf.put_fixed_str(&self.model, MODEL_WIDTH);
        buf.put_fixed_str(&self.udid, UDID_WIDTH);
        buf.put_fixed_str(&self.device_name, DEVICE_NAME_WIDTH);
        buf.put_fixed_str(&self.app_name, APP_NAME_WIDTH);
    }

    /// Decodes a received blob. The header is validated before any of the content is trusted.
    pub fn deserialize(src: &[u8]) -> anyhow::Result<PeerDescription> {
        let header = Header::deser(src)?;

        let body = &src[HEADER_SIZE..header.total_size];
        let checksum = CHECKSUM.checksum(body);
        if checksum != header.checksum {
            bail!("peer description checksum mismatch: {:08x} != {:08x}", checksum, header.checksum);
        }

        let mut buf = body;
        let platform = Platform::from_primitive(buf.try_get_u32_le()?);
        let gpu_family = GpuFamily::from_primitive(buf.try_get_u32_le()?);
        let platform_string = buf.try_get_fixed_str(PLATFORM_STRING_WIDTH)?;
        let version = buf.try_get_fixed_str(VERSION_WIDTH)?;
        let manufacturer = buf.try_get_fixed_str(MANUFACTURER_WIDTH)?;
        let model = buf.try_get_fixed_str(MODEL_WIDTH)?;
        let udid = buf.try_get_fixed_str(UDID_WIDTH)?;
        let device_name = buf.try_get_fixed_str(DEVICE_NAME_WIDTH)?;
        let app_name = buf.try_get_fixed_str(APP_NAME_WIDTH)?;

        let mut if_addresses = Vec::with_capacity(header.if_count);
        for _ in 0..header.if_count {
            if_addresses.push(IfAddress::deser(&mut buf)?);
        }

        let mut transports = Vec::with_capacity(header.transport_count);
        for _ in 0..header.transport_count {
            let raw_type = buf.try_get_u32_le()?;
            let transport_type = TransportType::try_from(raw_type)
                .map_err(|_| anyhow!("invalid transport type {}", raw_type))?;
            let address = Ipv4Addr::from(buf.try_get_array::<4>()?);
            let raw_port = buf.try_get_u32_le()?;
            let port = u16::try_from(raw_port)
                .map_err(|_| anyhow!("invalid port {}", raw_port))?;
            transports.push(TransportSpec {
                transport_type,
                endpoint: Endpoint::new(address, port),
            });
        }

        let mut services = Vec::with_capacity(header.service_count);
        for _ in 0..header.service_count {
            services.push(buf.try_get_u32_le()?);
        }

        Ok(PeerDescription {
            platform,
            gpu_family,
            platform_string,
            version,
            manufacturer,
            model,
            udid,
            device_name,
            app_name,
            if_addresses,
            net_config: NetConfig {
                role: header.role,
                transports,
                services,
            },
        })
    }

    /// Reads just the app name, validating the header but not the checksum or the variable
    ///  sections. This is meant for quickly filtering peers.
    pub fn extract_app_name(src: &[u8]) -> anyhow::Result<String> {
        Header::deser(src)?;
        let mut buf = &src[APP_NAME_OFFSET..];
        buf.try_get_fixed_str(APP_NAME_WIDTH)
    }
}
