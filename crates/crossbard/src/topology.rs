//! Node-to-network assignment.

use anyhow::{bail, Result};
use rand::Rng;

use crossbar_core::config::TopologyConfig;
use crossbar_core::frame::Addr;

pub struct Topology {
    pub networks: Vec<Network>,
}

pub struct Network {
    pub net: u8,
    pub listen_port: u16,
    pub nodes: Vec<Addr>,
}

impl Topology {
    /// Distribute `nodes` stations over `networks` networks: one each,
    /// the remainder at random. Network N listens on `base_port + N - 1`.
    pub fn assign<R: Rng>(
        nodes: usize,
        networks: usize,
        cfg: &TopologyConfig,
        rng: &mut R,
    ) -> Result<Self> {
        if networks == 0 || networks > u8::MAX as usize {
            bail!("network count must be between 1 and {}", u8::MAX);
        }
        if nodes < networks {
            bail!("need at least one node per network ({networks} networks, {nodes} nodes)");
        }

        let mut counts = vec![1usize; networks];
        for _ in 0..nodes - networks {
            counts[rng.gen_range(0..networks)] += 1;
        }
        if counts.iter().any(|&c| c > u8::MAX as usize) {
            bail!("more than {} nodes landed on one network", u8::MAX);
        }

        let networks = counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let net = (i + 1) as u8;
                Network {
                    net,
                    listen_port: cfg.base_port + i as u16,
                    nodes: (1..=count as u8).map(|node| Addr::new(net, node)).collect(),
                }
            })
            .collect();
        Ok(Self { networks })
    }

    pub fn addrs(&self) -> impl Iterator<Item = Addr> + '_ {
        self.networks.iter().flat_map(|n| n.nodes.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn every_network_gets_at_least_one_node() {
        let cfg = TopologyConfig::default();
        let mut rng = SmallRng::seed_from_u64(7);
        let topo = Topology::assign(10, 3, &cfg, &mut rng).unwrap();
        assert_eq!(topo.networks.len(), 3);
        assert!(topo.networks.iter().all(|n| !n.nodes.is_empty()));
        assert_eq!(topo.addrs().count(), 10);
        assert_eq!(topo.networks[0].listen_port, cfg.base_port);
        assert_eq!(topo.networks[2].listen_port, cfg.base_port + 2);
    }

    #[test]
    fn rejects_fewer_nodes_than_networks() {
        let cfg = TopologyConfig::default();
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(Topology::assign(2, 3, &cfg, &mut rng).is_err());
        assert!(Topology::assign(0, 0, &cfg, &mut rng).is_err());
    }
}
