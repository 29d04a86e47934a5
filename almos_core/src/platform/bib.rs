//! Boot Information Block parsing: the binary blob `info2bib` produces and
//! `arch_boot` consumes to learn the machine's cluster/device topology
//! before anything resembling a device tree exists to ask.
//!
//! Grounded on §6's BIB layout: a signature, a fixed header, a
//! cluster-descriptor array sized by the header's `cpu_nr`/`cid` fields,
//! and per-cluster device-descriptor arrays at `dev_offset`. Every field is
//! read through `byteorder` rather than transmuted in place, since the
//! blob is produced off-target and is not guaranteed to match the host's
//! endianness or alignment.

use alloc::vec::Vec;

use byteorder::{ByteOrder, LittleEndian};
use snafu::{ensure, Snafu};

use super::cluster::{ClusterId, ClusterTopology};
use crate::dqdt::MeshCoord;

/// The 16-byte magic every valid BIB blob begins with.
pub const SIGNATURE: &[u8; 16] = b"@ALMOS ARCH BIB\0";

const HEADER_LEN: usize = 16 + 8 * 4;
const CLUSTER_DESC_LEN: usize = 4 * 4;
const DEVICE_DESC_LEN: usize = 4 * 4;

/// Errors parsing a BIB blob.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The blob is too short to contain even the fixed header.
    Truncated,
    /// The leading 16 bytes do not match [`SIGNATURE`].
    BadSignature,
    /// A cluster or device descriptor array would read past the end of the blob.
    DescriptorOutOfBounds,
    /// Device id 0 in some cluster was not the RAM bank, violating §6's invariant.
    MissingRamBank,
}

type Result<T> = core::result::Result<T, Error>;

/// The BIB's fixed header, following the 16-byte signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub x_max: u32,
    pub y_max: u32,
    pub cpu_nr: u32,
    pub bootstrap_cpu: u32,
    pub bootstrap_tty: u32,
    pub bootstrap_dma: u32,
    pub reserved_start: u32,
    pub reserved_limit: u32,
}

/// One cluster's topology as recorded in the BIB, before its device descriptors are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub cid: u32,
    pub cpu_nr: u32,
    pub dev_nr: u32,
    pub dev_offset: u32,
}

/// One device attached to a cluster; device id 0 is always the cluster's RAM bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: u32,
    pub base: u32,
    pub size: u32,
    pub irq: u32,
}

/// A fully parsed BIB: the header plus every cluster's topology and device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bib {
    pub header: Header,
    pub clusters: Vec<(ClusterDescriptor, Vec<DeviceDescriptor>)>,
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    ensure!(bytes.len() >= offset + 4, DescriptorOutOfBoundsSnafu);
    Ok(LittleEndian::read_u32(&bytes[offset..offset + 4]))
}

impl Bib {
    /// Parses a raw BIB blob.
    ///
    /// # Errors
    /// See [`Error`]'s variants; a truncated or malformed blob is always reported as an error,
    /// never read out of bounds or panicked on.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= HEADER_LEN, TruncatedSnafu);
        ensure!(&bytes[0..16] == SIGNATURE, BadSignatureSnafu);

        let header = Header {
            x_max: read_u32(bytes, 16)?,
            y_max: read_u32(bytes, 20)?,
            cpu_nr: read_u32(bytes, 24)?,
            bootstrap_cpu: read_u32(bytes, 28)?,
            bootstrap_tty: read_u32(bytes, 32)?,
            bootstrap_dma: read_u32(bytes, 36)?,
            reserved_start: read_u32(bytes, 40)?,
            reserved_limit: read_u32(bytes, 44)?,
        };

        let cluster_nr = (header.x_max.max(1) * header.y_max.max(1)) as usize;
        let mut offset = HEADER_LEN;
        let mut clusters = Vec::with_capacity(cluster_nr);

        for _ in 0..cluster_nr {
            ensure!(bytes.len() >= offset + CLUSTER_DESC_LEN, DescriptorOutOfBoundsSnafu);
            let desc = ClusterDescriptor {
                cid: read_u32(bytes, offset)?,
                cpu_nr: read_u32(bytes, offset + 4)?,
                dev_nr: read_u32(bytes, offset + 8)?,
                dev_offset: read_u32(bytes, offset + 12)?,
            };
            offset += CLUSTER_DESC_LEN;

            let mut devices = Vec::with_capacity(desc.dev_nr as usize);
            let mut dev_offset = desc.dev_offset as usize;
            for _ in 0..desc.dev_nr {
                ensure!(
                    bytes.len() >= dev_offset + DEVICE_DESC_LEN,
                    DescriptorOutOfBoundsSnafu
                );
                devices.push(DeviceDescriptor {
                    id: read_u32(bytes, dev_offset)?,
                    base: read_u32(bytes, dev_offset + 4)?,
                    size: read_u32(bytes, dev_offset + 8)?,
                    irq: read_u32(bytes, dev_offset + 12)?,
                });
                dev_offset += DEVICE_DESC_LEN;
            }
            ensure!(
                devices.first().is_some_and(|d| d.id == 0),
                MissingRamBankSnafu
            );

            clusters.push((desc, devices));
        }

        Ok(Self { header, clusters })
    }

    /// Converts the parsed cluster descriptors into [`ClusterTopology`] records, deriving each
    /// cluster's `(x, y)` mesh coordinates from its linear index.
    #[must_use]
    pub fn cluster_topology(&self) -> Vec<ClusterTopology> {
        self.clusters
            .iter()
            .enumerate()
            .map(|(index, (desc, _))| {
                let x = (index as u32 % self.header.x_max.max(1)) as i32;
                let y = (index as u32 / self.header.x_max.max(1)) as i32;
                let id = ClusterId::new(desc.cid, self.header.x_max, MeshCoord { x, y });
                ClusterTopology::new(id, desc.cpu_nr, desc.cid == self.header.bootstrap_cpu)
            })
            .collect()
    }
}
