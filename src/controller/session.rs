//! Presenter session lifecycle: resources that exist only while presenting.
//!
//! The UI layer hands in whatever it opened for the presentation (a presenter
//! popup, a camera stream) as [`PresentationResource`]s. Ending the session
//! releases them exactly once; releasing again is a no-op.

use log::debug;

pub trait PresentationResource {
    /// Short name for logs, e.g. "popup" or "camera".
    fn label(&self) -> &str;

    /// Close / stop the resource. Called at most once per resource.
    fn release(&mut self);
}

#[derive(Default)]
pub struct PresenterSession {
    resources: Vec<Box<dyn PresentationResource>>,
}

impl PresenterSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, resource: Box<dyn PresentationResource>) {
        debug!("session: attached {}", resource.label());
        self.resources.push(resource);
    }

    pub fn is_holding(&self) -> bool {
        !self.resources.is_empty()
    }

    /// Release everything held, newest first. Returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let count = self.resources.len();
        while let Some(mut resource) = self.resources.pop() {
            debug!("session: releasing {}", resource.label());
            resource.release();
        }
        count
    }
}

impl Drop for PresenterSession {
    fn drop(&mut self) {
        self.release_all();
    }
}
