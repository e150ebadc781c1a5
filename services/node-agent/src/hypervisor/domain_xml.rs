//! libvirt domain XML.

use std::fmt::Write;
use std::path::Path;

use crate::state::VmSpec;

/// Render the domain definition for a spec.
///
/// Disk paths must be the ones the hypervisor host sees, which differ from
/// the agent's own paths when the agent runs in a container.
pub fn render_domain_xml(spec: &VmSpec, disk_path: &Path, seed_path: &Path) -> String {
    let mut xml = String::new();

    // Writing to a String cannot fail.
    let _ = write!(
        xml,
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <vcpu>{vcpus}</vcpu>
  <os>
    <type arch='{arch}'>hvm</type>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <graphics type='spice' autoport='yes'/>
  </devices>
</domain>
"#,
        name = escape(&spec.name),
        memory = spec.memory_mib,
        vcpus = spec.vcpus,
        arch = escape(&spec.os_arch),
        disk = escape(&disk_path.display().to_string()),
        seed = escape(&seed_path.display().to_string()),
        network = escape(&spec.network_name),
    );

    xml
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
