use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;

/// How `offer(n)` on a sender is interpreted
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OfferMode {
    /// `n` is the number of deliveries currently offered, replacing the previous value. This
    ///  allows re-sending an offer after reconnecting without double counting.
    Absolute,
    /// `n` is added to the previously offered count
    Cumulative,
}

pub struct EngineConfig {
    /// The maximum payload size of a single transfer frame. Larger message fragments are split
    ///  into several transfers.
    pub max_frame_payload: usize,

    /// Upper bound for the bytes written to the outbound buffer in a single engine tick. A frame
    ///  that would exceed it is held back for the next tick unless the buffer is empty.
    pub max_output_per_tick: usize,

    /// The maximum number of links a mux will hold, including links created by the peer
    pub max_links: usize,

    /// If set, partial deliveries that see no activity for this long are aborted on `tick()`.
    ///  Otherwise deliveries live until they are settled or their link detaches.
    pub delivery_idle_timeout: Option<Duration>,

    pub default_link_config: LinkConfig,
    pub specific_link_configs: FxHashMap<String, LinkConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_frame_payload: 16*1024,
            max_output_per_tick: 256*1024,
            max_links: 1024,
            delivery_idle_timeout: None,
            default_link_config: LinkConfig::default(),
            specific_link_configs: FxHashMap::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_payload == 0 {
            bail!("max frame payload must be positive");
        }
        if self.max_output_per_tick < self.max_frame_payload {
            bail!("max output per tick ({}) must be at least the max frame payload ({})", self.max_output_per_tick, self.max_frame_payload);
        }
        if self.max_links == 0 {
            bail!("max links must be positive");
        }
        if let Some(timeout) = self.delivery_idle_timeout {
            if timeout.is_zero() {
                bail!("delivery idle timeout must not be zero");
            }
        }

        self.default_link_config.validate("<default>")?;
        for (name, link_config) in &self.specific_link_configs {
            link_config.validate(name)?;
        }

        Ok(())
    }

    pub fn get_effective_link_config(&self, link_name: &str) -> EffectiveLinkConfig {
        let raw = self.specific_link_configs.get(link_name)
            .unwrap_or(&self.default_link_config);

        EffectiveLinkConfig {
            max_frame_payload: self.max_frame_payload,
            offer_mode: raw.offer_mode,
            credit_window: raw.credit_window,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub offer_mode: OfferMode,

    /// If set, a receiver whose credit is exhausted tops it up to this value as soon as the
    ///  application settles a delivery. Without it, credit is only ever granted by `flow()`.
    pub credit_window: Option<u32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            offer_mode: OfferMode::Absolute,
            credit_window: None,
        }
    }
}

impl LinkConfig {
    fn validate(&self, link_name: &str) -> anyhow::Result<()> {
        if self.credit_window == Some(0) {
            bail!("credit window for link {} must be positive if set", link_name);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EffectiveLinkConfig {
    pub max_frame_payload: usize,
    pub offer_mode: OfferMode,
    pub credit_window: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn with_specific(name: &str, link_config: LinkConfig) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.specific_link_configs.insert(name.to_string(), link_config);
        config
    }

    #[rstest]
    #[case::default(EngineConfig::default(), true)]
    #[case::zero_payload(EngineConfig { max_frame_payload: 0, ..EngineConfig::default() }, false)]
    #[case::output_too_small(EngineConfig { max_frame_payload: 100, max_output_per_tick: 99, ..EngineConfig::default() }, false)]
    #[case::output_equal(EngineConfig { max_frame_payload: 100, max_output_per_tick: 100, ..EngineConfig::default() }, true)]
    #[case::zero_links(EngineConfig { max_links: 0, ..EngineConfig::default() }, false)]
    #[case::zero_idle(EngineConfig { delivery_idle_timeout: Some(Duration::ZERO), ..EngineConfig::default() }, false)]
    #[case::idle(EngineConfig { delivery_idle_timeout: Some(Duration::from_secs(3)), ..EngineConfig::default() }, true)]
    #[case::zero_window(with_specific("a", LinkConfig { offer_mode: OfferMode::Absolute, credit_window: Some(0) }), false)]
    #[case::window(with_specific("a", LinkConfig { offer_mode: OfferMode::Absolute, credit_window: Some(10) }), true)]
    fn test_validate(#[case] config: EngineConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[rstest]
    #[case::default("b", OfferMode::Absolute, None)]
    #[case::specific("a", OfferMode::Cumulative, Some(5))]
    fn test_effective_link_config(#[case] name: &str, #[case] expected_mode: OfferMode, #[case] expected_window: Option<u32>) {
        let mut config = with_specific("a", LinkConfig { offer_mode: OfferMode::Cumulative, credit_window: Some(5) });
        config.max_frame_payload = 77;

        let effective = config.get_effective_link_config(name);
        assert_eq!(effective.max_frame_payload, 77);
        assert_eq!(effective.offer_mode, expected_mode);
        assert_eq!(effective.credit_window, expected_window);
    }
}
