//! Out-of-dialog request usages (OPTIONS and friends).

/// A one-shot request we sent outside any dialog.
#[derive(Debug, Clone)]
pub struct ClientOutOfDialog {
    pub serial: u64,
    pub method: rsip::Method,
    pub completed: bool,
}

impl ClientOutOfDialog {
    pub fn new(serial: u64, method: rsip::Method) -> Self {
        ClientOutOfDialog {
            serial,
            method,
            completed: false,
        }
    }

    /// Final responses complete the usage; provisionals keep it alive.
    pub fn on_status(&mut self, status: u16) -> bool {
        if status >= 200 {
            self.completed = true;
        }
        self.completed
    }
}

/// A one-shot request a peer sent us outside any dialog.
#[derive(Debug, Clone)]
pub struct ServerOutOfDialog {
    pub serial: u64,
    pub method: rsip::Method,
}

impl ServerOutOfDialog {
    pub fn new(serial: u64, method: rsip::Method) -> Self {
        ServerOutOfDialog { serial, method }
    }
}
