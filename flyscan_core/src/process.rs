//! Registry of the controllers in one process, addressed by MRI.

use std::collections::BTreeMap;

use crate::controller::Controller;
use crate::error::{Result, ScanError};

#[derive(Debug, Default)]
pub struct Process {
    controllers: BTreeMap<String, Controller>,
}

impl Process {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_controller(&mut self, controller: Controller) -> Result<()> {
        let mri = controller.mri().to_string();
        if self.controllers.contains_key(&mri) {
            return Err(ScanError::Config(format!("controller {mri} already registered")).into());
        }
        tracing::debug!(%mri, "controller registered");
        self.controllers.insert(mri, controller);
        Ok(())
    }

    pub fn get_controller(&self, mri: &str) -> Result<Controller> {
        self.controllers
            .get(mri)
            .cloned()
            .ok_or_else(|| ScanError::Config(format!("no controller {mri}")).into())
    }

    pub fn mris(&self) -> impl Iterator<Item = &str> {
        self.controllers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerCfg;

    fn ctrl(mri: &str) -> Controller {
        Controller::new(
            ControllerCfg {
                mri: mri.into(),
                ..ControllerCfg::default()
            },
            vec![],
        )
    }

    #[test]
    fn lookup_by_mri() {
        let mut p = Process::new();
        p.add_controller(ctrl("BL:SCAN")).unwrap();
        p.add_controller(ctrl("BL:DET")).unwrap();
        assert!(p.add_controller(ctrl("BL:DET")).is_err());
        assert_eq!(p.get_controller("BL:SCAN").unwrap().mri(), "BL:SCAN");
        assert!(p.get_controller("nope").is_err());
        assert_eq!(p.mris().collect::<Vec<_>>(), vec!["BL:DET", "BL:SCAN"]);
    }
}
