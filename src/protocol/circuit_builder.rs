//! Circuit construction
//!
//! Builds fully extended circuits: CREATE_FAST to the guard (the bridge),
//! then EXTEND2 per additional hop. Relay information comes from a transient
//! single-hop "consensus circuit" used only for directory traffic and
//! disposed before returning.
//!
//! Tor destroys a circuit on any failed extension, so every retry starts
//! over from a fresh CREATE_FAST base with new relay picks.

use std::rc::Rc;

use rand::seq::SliceRandom;
use x25519_dalek::PublicKey;

use super::circuit::{Circuit, ExtendTarget};
use super::consensus::{Consensus, Microdesc, MicrodescHead};
use super::directory::Directory;
use super::keynet::KeynetAddress;
use super::link::TorLink;
use crate::error::{Result, TorError};

/// Build attempts before giving up.
const MAX_BUILD_ATTEMPTS: usize = 10;

/// Deadline for the CREATE_FAST round trip.
const CREATE_TIMEOUT_MS: u32 = 10_000;

pub struct CircuitBuilder {
    directory: Rc<Directory>,
    extend_timeout_ms: u32,
}

impl CircuitBuilder {
    pub fn new(directory: Rc<Directory>, extend_timeout_ms: u32) -> Self {
        Self {
            directory,
            extend_timeout_ms,
        }
    }

    /// Build a fully extended circuit on `link`.
    ///
    /// The standard path is guard → middle → exit. For a `.keynet`
    /// destination the path is guard → middle → middle → keynet relay, with
    /// the final hop resolved by its Ed25519 key.
    pub async fn build(
        &self,
        link: &Rc<TorLink>,
        keynet: Option<&KeynetAddress>,
    ) -> Result<Circuit> {
        // Transient single-hop circuit for directory traffic.
        let dir_circuit = Circuit::open(link)?;
        if let Err(e) = dir_circuit.create_fast(CREATE_TIMEOUT_MS).await {
            dir_circuit.destroy(0);
            return Err(e);
        }

        let result = self.build_with_directory(link, &dir_circuit, keynet).await;
        dir_circuit.destroy(0);
        result
    }

    async fn build_with_directory(
        &self,
        link: &Rc<TorLink>,
        dir_circuit: &Circuit,
        keynet: Option<&KeynetAddress>,
    ) -> Result<Circuit> {
        let consensus = self.directory.get_consensus(dir_circuit).await?;

        let middles: Vec<&MicrodescHead> =
            consensus.relays.iter().filter(|r| r.is_middle()).collect();
        if middles.is_empty() {
            return Err(TorError::InsufficientRelays("no middle candidates".into()));
        }

        // The final hop is fixed for .keynet; exits are drawn per attempt
        // otherwise.
        let keynet_final = match keynet {
            Some(address) => Some(
                self.resolve_keynet_target(dir_circuit, &consensus, address)
                    .await?,
            ),
            None => None,
        };
        let exits: Vec<&MicrodescHead> =
            consensus.relays.iter().filter(|r| r.is_exit()).collect();
        if keynet_final.is_none() && exits.is_empty() {
            return Err(TorError::InsufficientRelays("no exit candidates".into()));
        }

        let mut rng = rand::thread_rng();
        let mut last_cause = String::from("no attempts made");

        for attempt in 1..=MAX_BUILD_ATTEMPTS {
            let path = match &keynet_final {
                None => {
                    let middle = *middles.choose(&mut rng).expect("checked non-empty");
                    let exit = *exits.choose(&mut rng).expect("checked non-empty");
                    if middle.identity == exit.identity {
                        last_cause = "middle and exit collide".into();
                        continue;
                    }
                    vec![Pick::Head(middle), Pick::Head(exit)]
                }
                Some(final_target) => {
                    let first = *middles.choose(&mut rng).expect("checked non-empty");
                    let second = *middles.choose(&mut rng).expect("checked non-empty");
                    if first.identity == second.identity
                        || first.identity == final_target.rsa_identity
                        || second.identity == final_target.rsa_identity
                    {
                        last_cause = "middle picks collide".into();
                        continue;
                    }
                    vec![
                        Pick::Head(first),
                        Pick::Head(second),
                        Pick::Target(final_target.clone()),
                    ]
                }
            };

            log::debug!("circuit build attempt {}/{}", attempt, MAX_BUILD_ATTEMPTS);
            match self.try_build_path(link, dir_circuit, &path).await {
                Ok(circuit) => {
                    log::info!(
                        "circuit {:#010x} built with {} hops on attempt {}",
                        circuit.id(),
                        circuit.hop_count(),
                        attempt
                    );
                    return Ok(circuit);
                }
                Err(e) => {
                    // A link-fatal error means the bridge connection itself
                    // is gone; further attempts on this link cannot succeed.
                    // Surface it so the manager reconnects instead of
                    // burning the attempt budget.
                    if e.is_fatal() {
                        log::warn!("build attempt {} hit fatal link error: {}", attempt, e);
                        return Err(e);
                    }
                    log::warn!("build attempt {} failed: {}", attempt, e);
                    last_cause = e.to_string();
                }
            }
        }

        Err(TorError::CircuitBuildExhausted { last_cause })
    }

    /// One attempt: fresh base circuit, then extend hop by hop.
    async fn try_build_path(
        &self,
        link: &Rc<TorLink>,
        dir_circuit: &Circuit,
        path: &[Pick<'_>],
    ) -> Result<Circuit> {
        // Resolve microdescriptors up front so extension failures are
        // attributable to the relays themselves.
        let mut targets = Vec::with_capacity(path.len());
        for pick in path {
            match pick {
                Pick::Head(head) => {
                    let md = self.directory.get_microdesc(dir_circuit, head).await?;
                    targets.push(extend_target(head, &md));
                }
                Pick::Target(target) => targets.push(target.clone()),
            }
        }

        let circuit = Circuit::open(link)?;
        let built = async {
            circuit.create_fast(CREATE_TIMEOUT_MS).await?;
            for target in &targets {
                circuit.extend(target, self.extend_timeout_ms).await?;
            }
            Ok(())
        }
        .await;

        match built {
            Ok(()) => Ok(circuit),
            Err(e) => {
                circuit.destroy(0);
                Err(e)
            }
        }
    }

    /// Resolve a .keynet address to its relay.
    ///
    /// Two stages: a coarse pass keeps relays whose RSA fingerprint shares
    /// its first byte with the requested key, then their microdescriptors
    /// are fetched and matched exactly on `id ed25519`.
    async fn resolve_keynet_target(
        &self,
        dir_circuit: &Circuit,
        consensus: &Consensus,
        address: &KeynetAddress,
    ) -> Result<ExtendTarget> {
        let coarse: Vec<MicrodescHead> = consensus
            .relays
            .iter()
            .filter(|r| r.identity[0] == address.public_key[0])
            .cloned()
            .collect();
        if coarse.is_empty() {
            return Err(TorError::KeynetExitNotFound);
        }
        log::debug!("{} coarse candidates for .keynet lookup", coarse.len());

        let microdescs = self.directory.get_microdescs(dir_circuit, &coarse).await?;
        for (head, md) in coarse.iter().zip(microdescs.iter()) {
            if md.id_ed25519 == Some(address.public_key) {
                log::info!(".keynet relay resolved: {}", head.nickname);
                return Ok(extend_target(head, md));
            }
        }
        Err(TorError::KeynetExitNotFound)
    }
}

enum Pick<'a> {
    Head(&'a MicrodescHead),
    Target(ExtendTarget),
}

fn extend_target(head: &MicrodescHead, md: &Microdesc) -> ExtendTarget {
    ExtendTarget {
        ip: head.ip,
        or_port: head.or_port,
        rsa_identity: head.identity,
        ed_identity: md.id_ed25519,
        ntor_onion_key: PublicKey::from(md.ntor_onion_key),
    }
}
