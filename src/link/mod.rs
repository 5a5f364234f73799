/*
This module is home to the continuity controller: the one owner of the
credential, the event stream and the timers that keep both alive.

It authenticates on start, renews the access token before the server-side
expiry, and when the token rotates or the stream drops it tears both down
and rebuilds them, retrying on a fixed interval until the cloud comes back
or the link is stopped.
*/

mod service;
mod status;

pub use service::{CloudLink, SetupError};
pub use status::{LinkState, LinkStatus};
