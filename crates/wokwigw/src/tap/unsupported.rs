use std::io;

#[derive(Debug)]
pub struct TapDevice {
    name: String,
}

fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "TAP interfaces are only supported on Linux",
    )
}

impl TapDevice {
    pub fn create(_requested: Option<&str>) -> io::Result<Self> {
        Err(unsupported())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(unsupported())
    }

    pub async fn send(&self, _frame: &[u8]) -> io::Result<usize> {
        Err(unsupported())
    }
}
