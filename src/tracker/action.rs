/// Actions of the UDP tracker protocol (BEP 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Action {
    #[default]
    Connect = 0,
    Announce = 1,
    Scrape = 2,
    Error = 3,
}
