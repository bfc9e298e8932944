// scenesync-common: wire protocol and room addressing shared by the realtime
// server and its clients.

pub mod protocol;
pub mod room;
