use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use rand_core::{OsRng, RngCore};

/// Guest device the backup/restore disk is attached as.
pub const BACKUP_TARGET_DEV: &str = "vdb";

/// Everything that varies between two domains.
pub struct DomainSpec<'a> {
    pub name: &'a str,
    pub ram_bytes: u64,
    pub cpu_count: u32,
    pub disk_path: &'a Path,
    pub cloud_init_path: &'a Path,
    pub network: &'a str,
    pub mac: &'a str,
}

/// Generate libvirt domain XML. `<name>` is the first child element.
pub fn generate_domain_xml(spec: &DomainSpec<'_>) -> String {
    let name = spec.name;
    let memory_kib = spec.ram_bytes / 1024;
    let cpus = spec.cpu_count;
    let disk = spec.disk_path.display();
    let cloud_init = spec.cloud_init_path.display();
    let network = spec.network;
    let mac = spec.mac;

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' discard='unmap'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{cloud_init}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <mac address='{mac}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}

/// Hot-pluggable disk element for a backup volume.
pub fn backup_disk_xml(path: &Path, format: &str) -> String {
    format!(
        "<disk type='file' device='disk'>\
         <driver name='qemu' type='{format}'/>\
         <source file='{}'/>\
         <target dev='{BACKUP_TARGET_DEV}' bus='virtio'/>\
         </disk>",
        path.display()
    )
}

/// Name of the domain described by `xml`.
pub fn domain_name_of(xml: &str) -> Option<String> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = xml[start..].find("</name>")? + start;
    Some(xml[start..end].trim().to_string())
}

/// Locally administered QEMU addresses (`52:54:00:xx:xx:xx`), unique among
/// the domains this process knows about.
#[derive(Default)]
pub struct MacGenerator {
    issued: Mutex<HashSet<String>>,
}

impl MacGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark addresses already owned by known VMs.
    pub fn reserve<'a>(&self, macs: impl IntoIterator<Item = &'a str>) {
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.extend(macs.into_iter().map(str::to_string));
    }

    /// Hand an address back once no domain uses it.
    pub fn release(&self, mac: &str) {
        self.issued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(mac);
    }

    pub fn in_use(&self, mac: &str) -> bool {
        self.issued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(mac)
    }

    pub fn issued_count(&self) -> usize {
        self.issued.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn next(&self) -> String {
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            let mut tail = [0u8; 3];
            OsRng.fill_bytes(&mut tail);
            let mac = format!("52:54:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2]);
            if issued.insert(mac.clone()) {
                return mac;
            }
        }
    }
}
