use crate::cmd;
use crate::errors::Result;

/// Installs the rules allowing container connectivity: default-DROP forward
/// policy, masquerading for the allocated subnet out the internet-facing
/// interface, and bidirectional forwarding between that interface and the
/// veth.
pub fn install_rules(masquerade_ip: &str, net_interface: &str, veth_name: &str) -> Result<()> {
    cmd::run("iptables", &["-P", "FORWARD", "DROP"])?;
    cmd::run(
        "iptables",
        &[
            "-t", "nat", "-A", "POSTROUTING", "-s", masquerade_ip, "-o", net_interface, "-j",
            "MASQUERADE",
        ],
    )?;
    cmd::run(
        "iptables",
        &["-A", "FORWARD", "-i", net_interface, "-o", veth_name, "-j", "ACCEPT"],
    )?;
    cmd::run(
        "iptables",
        &["-A", "FORWARD", "-o", net_interface, "-i", veth_name, "-j", "ACCEPT"],
    )?;
    Ok(())
}

/// Removes exactly the rules `install_rules` added, nothing else. Returns
/// the first accumulated failure but attempts every deletion.
pub fn remove_rules(masquerade_ip: &str, net_interface: &str, veth_name: &str) -> Result<()> {
    let results = [
        cmd::run(
            "iptables",
            &[
                "-t", "nat", "-D", "POSTROUTING", "-s", masquerade_ip, "-o", net_interface,
                "-j", "MASQUERADE",
            ],
        ),
        cmd::run(
            "iptables",
            &["-D", "FORWARD", "-i", net_interface, "-o", veth_name, "-j", "ACCEPT"],
        ),
        cmd::run(
            "iptables",
            &["-D", "FORWARD", "-o", net_interface, "-i", veth_name, "-j", "ACCEPT"],
        ),
    ];
    for result in results {
        result?;
    }
    Ok(())
}
