/// Client link progress. Each state only accepts its own opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    AuthedGameGuard,
    AuthedLogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameServerState {
    Connected,
    BlowfishConnected,
    Authed,
}
