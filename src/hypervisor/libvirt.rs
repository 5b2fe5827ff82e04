use std::path::{Path, PathBuf};

use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;

use super::{Hypervisor, VolumeInfo, VolumeReader, VolumeWriter, xml};
use crate::error::MulchError;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// A single long-lived libvirt connection shared by every operation.
pub struct LibvirtHypervisor {
    conn: ConnGuard,
    uri: String,
}

impl LibvirtHypervisor {
    pub fn connect(uri: &str) -> Result<Self, MulchError> {
        // Errors are surfaced through Result only, not printed by the C library.
        virt_error::clear_error_callback();

        let conn = Connect::open(Some(uri)).map_err(|e| MulchError::Libvirt {
            message: format!("failed to connect to libvirt: {e}"),
            hint: format!("ensure libvirtd is running and you have access to {uri}"),
        })?;
        tracing::info!(uri, "libvirt connection OK");
        Ok(Self {
            conn: ConnGuard(conn),
            uri: uri.to_string(),
        })
    }

    fn pool(&self, name: &str) -> Result<StoragePool, MulchError> {
        StoragePool::lookup_by_name(&self.conn, name).map_err(|e| MulchError::Libvirt {
            message: format!("storage pool '{name}' not found: {e}"),
            hint: "pools are created when mulchd starts".into(),
        })
    }

    fn volume(&self, pool: &str, name: &str) -> Result<StorageVol, MulchError> {
        let p = self.pool(pool)?;
        StorageVol::lookup_by_name(&p, name).map_err(|e| MulchError::Volume {
            pool: pool.into(),
            name: name.into(),
            message: format!("lookup failed: {e}"),
        })
    }

    fn domain(&self, name: &str) -> Result<Domain, MulchError> {
        Domain::lookup_by_name(&self.conn, name).map_err(|e| MulchError::Libvirt {
            message: format!("domain '{name}' not found: {e}"),
            hint: format!("check `virsh -c {} list --all`", self.uri),
        })
    }

    fn new_stream(&self) -> Result<Stream, MulchError> {
        Stream::new(&self.conn, 0).map_err(|e| MulchError::Libvirt {
            message: format!("failed to open stream: {e}"),
            hint: String::new(),
        })
    }

    fn volume_info(&self, pool: &str, vol: &StorageVol) -> Result<VolumeInfo, MulchError> {
        let vol_err = |e: virt_error::Error| MulchError::Volume {
            pool: pool.into(),
            name: String::new(),
            message: e.to_string(),
        };
        let name = vol.get_name().map_err(vol_err)?;
        let info = vol.get_info().map_err(vol_err)?;
        let path = vol.get_path().map_err(vol_err)?;
        Ok(VolumeInfo {
            pool: pool.into(),
            name,
            capacity: info.capacity,
            path: PathBuf::from(path),
        })
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn ensure_pool(&self, name: &str, path: &Path, mode: &str) -> Result<(), MulchError> {
        let pool = match StoragePool::lookup_by_name(&self.conn, name) {
            Ok(pool) => pool,
            Err(_) => {
                tracing::info!(pool = name, path = %path.display(), "creating storage pool");
                let def = xml::pool_xml(name, &path.display().to_string(), mode)?;
                let pool = StoragePool::define_xml(&self.conn, &def, 0).map_err(|e| {
                    MulchError::Libvirt {
                        message: format!("failed to define pool '{name}': {e}"),
                        hint: "check libvirt permissions".into(),
                    }
                })?;
                pool.build(0).map_err(|e| MulchError::Libvirt {
                    message: format!("failed to build pool '{name}': {e}"),
                    hint: format!("check that {} is writable", path.display()),
                })?;
                pool.set_autostart(true).ok();
                pool
            }
        };

        if !pool.is_active().unwrap_or(false) {
            pool.create(0).map_err(|e| MulchError::Libvirt {
                message: format!("failed to start pool '{name}': {e}"),
                hint: format!("try `virsh pool-start {name}`"),
            })?;
        }
        Ok(())
    }

    fn ensure_network(&self, name: &str, subnet: &str) -> Result<(), MulchError> {
        let net = match Network::lookup_by_name(&self.conn, name) {
            Ok(net) => net,
            Err(_) => {
                tracing::info!(network = name, subnet, "creating network");
                let def = xml::network_xml(name, subnet)?;
                let net = Network::define_xml(&self.conn, &def).map_err(|e| MulchError::Libvirt {
                    message: format!("failed to define network '{name}': {e}"),
                    hint: "check libvirt permissions".into(),
                })?;
                net.set_autostart(true).ok();
                net
            }
        };

        if !net.is_active().unwrap_or(false) {
            net.create().map_err(|e| MulchError::Libvirt {
                message: format!("failed to start network '{name}': {e}"),
                hint: format!("try `virsh net-start {name}`"),
            })?;
        }
        Ok(())
    }

    fn pool_root(&self, pool: &str) -> Result<PathBuf, MulchError> {
        let desc = self.pool(pool)?.get_xml_desc(0).map_err(|e| MulchError::Libvirt {
            message: format!("failed to describe pool '{pool}': {e}"),
            hint: String::new(),
        })?;
        xml::pool_target_path(&desc)
            .map(PathBuf::from)
            .ok_or_else(|| MulchError::Libvirt {
                message: format!("pool '{pool}' has no target path"),
                hint: "only directory pools are supported".into(),
            })
    }

    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, MulchError> {
        let p = self.pool(pool)?;
        match StorageVol::lookup_by_name(&p, name) {
            Ok(vol) => self.volume_info(pool, &vol).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn create_volume(&self, pool: &str, xml_spec: &str) -> Result<VolumeInfo, MulchError> {
        let p = self.pool(pool)?;
        let vol = StorageVol::create_xml(&p, xml_spec, 0).map_err(|e| MulchError::Volume {
            pool: pool.into(),
            name: String::new(),
            message: format!("create failed: {e}"),
        })?;
        self.volume_info(pool, &vol)
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), MulchError> {
        self.volume(pool, name)?
            .delete(0)
            .map_err(|e| MulchError::Volume {
                pool: pool.into(),
                name: name.into(),
                message: format!("delete failed: {e}"),
            })
    }

    fn resize_volume(&self, pool: &str, name: &str, capacity: u64) -> Result<(), MulchError> {
        self.volume(pool, name)?
            .resize(capacity, 0)
            .map(|_| ())
            .map_err(|e| MulchError::Volume {
                pool: pool.into(),
                name: name.into(),
                message: format!("resize failed: {e}"),
            })
    }

    fn download(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeReader>, MulchError> {
        let vol = self.volume(pool, name)?;
        let stream = self.new_stream()?;
        vol.download(&stream, 0, 0, 0).map_err(|e| MulchError::Volume {
            pool: pool.into(),
            name: name.into(),
            message: format!("download failed: {e}"),
        })?;
        Ok(Box::new(StreamReader {
            stream,
            label: format!("{pool}/{name}"),
        }))
    }

    fn upload(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeWriter>, MulchError> {
        let vol = self.volume(pool, name)?;
        let stream = self.new_stream()?;
        vol.upload(&stream, 0, 0, 0).map_err(|e| MulchError::Volume {
            pool: pool.into(),
            name: name.into(),
            message: format!("upload failed: {e}"),
        })?;
        Ok(Box::new(StreamWriter {
            stream,
            label: format!("{pool}/{name}"),
        }))
    }

    fn define_domain(&self, xml_spec: &str) -> Result<(), MulchError> {
        Domain::define_xml(&self.conn, xml_spec)
            .map(|_| ())
            .map_err(|e| MulchError::Libvirt {
                message: format!("failed to define domain: {e}"),
                hint: "check the generated domain XML for errors".into(),
            })
    }

    fn start_domain(&self, name: &str) -> Result<(), MulchError> {
        self.domain(name)?
            .create()
            .map(|_| ())
            .map_err(|e| MulchError::Libvirt {
                message: format!("failed to start domain '{name}': {e}"),
                hint: format!("check `virsh -c {} start {name}` for details", self.uri),
            })
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), MulchError> {
        self.domain(name)?
            .shutdown()
            .map(|_| ())
            .map_err(|e| MulchError::Libvirt {
                message: format!("shutdown failed: {e}"),
                hint: "VM may not support ACPI shutdown".into(),
            })
    }

    fn destroy_domain(&self, name: &str) -> Result<(), MulchError> {
        self.domain(name)?
            .destroy()
            .map(|_| ())
            .map_err(|e| MulchError::Libvirt {
                message: format!("force stop failed: {e}"),
                hint: "check libvirt permissions".into(),
            })
    }

    fn undefine_domain(&self, name: &str) -> Result<(), MulchError> {
        self.domain(name)?
            .undefine()
            .map(|_| ())
            .map_err(|e| MulchError::Libvirt {
                message: format!("failed to undefine domain '{name}': {e}"),
                hint: "check libvirt permissions".into(),
            })
    }

    fn domain_exists(&self, name: &str) -> Result<bool, MulchError> {
        Ok(Domain::lookup_by_name(&self.conn, name).is_ok())
    }

    fn domain_is_active(&self, name: &str) -> Result<bool, MulchError> {
        match Domain::lookup_by_name(&self.conn, name) {
            Ok(dom) => Ok(dom.is_active().unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }

    fn domain_address(&self, name: &str) -> Result<Option<String>, MulchError> {
        let dom = self.domain(name)?;
        let Ok(ifaces) =
            dom.interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
        else {
            return Ok(None);
        };
        // typed == 0 is VIR_IP_ADDR_TYPE_IPV4
        Ok(ifaces
            .iter()
            .flat_map(|iface| iface.addrs.iter())
            .find(|addr| addr.typed == 0)
            .map(|addr| addr.addr.clone()))
    }

    fn attach_device(&self, domain: &str, xml_spec: &str) -> Result<(), MulchError> {
        self.domain(domain)?
            .attach_device(xml_spec)
            .map(|_| ())
            .map_err(|e| MulchError::Libvirt {
                message: format!("failed to attach device to '{domain}': {e}"),
                hint: String::new(),
            })
    }

    fn detach_device(&self, domain: &str, xml_spec: &str) -> Result<(), MulchError> {
        self.domain(domain)?
            .detach_device(xml_spec)
            .map(|_| ())
            .map_err(|e| MulchError::Libvirt {
                message: format!("failed to detach device from '{domain}': {e}"),
                hint: String::new(),
            })
    }
}

struct StreamReader {
    stream: Stream,
    label: String,
}

impl VolumeReader for StreamReader {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, MulchError> {
        self.stream.recv(buf).map_err(|e| MulchError::Libvirt {
            message: format!("reading {}: {e}", self.label),
            hint: String::new(),
        })
    }

    fn finish(self: Box<Self>) -> Result<(), MulchError> {
        let StreamReader { mut stream, label } = *self;
        stream.finish().map_err(|e| MulchError::Libvirt {
            message: format!("closing download of {label}: {e}"),
            hint: String::new(),
        })
    }
}

struct StreamWriter {
    stream: Stream,
    label: String,
}

impl VolumeWriter for StreamWriter {
    fn send(&mut self, mut data: &[u8]) -> Result<(), MulchError> {
        while !data.is_empty() {
            let sent = self.stream.send(data).map_err(|e| MulchError::Libvirt {
                message: format!("writing {}: {e}", self.label),
                hint: String::new(),
            })?;
            data = &data[sent..];
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), MulchError> {
        let StreamWriter { mut stream, label } = *self;
        stream.finish().map_err(|e| MulchError::Libvirt {
            message: format!("closing upload of {label}: {e}"),
            hint: String::new(),
        })
    }
}
