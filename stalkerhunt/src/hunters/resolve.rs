use async_trait::async_trait;

use super::{HuntRecord, resolve};
use crate::{target::Target, worker::Worker};

/// Resolves each target: one [`HuntRecord::Resolved`] per distinct address.
///
/// A name that does not resolve fails its task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveHunter;

#[async_trait]
impl Worker for ResolveHunter {
    type Session = ();
    type Record = HuntRecord;

    fn open_session(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, _session: &mut (), target: &Target) -> anyhow::Result<Vec<HuntRecord>> {
        Ok(resolve(target)
            .await?
            .into_iter()
            .map(|address| HuntRecord::Resolved { address })
            .collect())
    }
}
