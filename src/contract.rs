use ethers::contract::abigen;

// Minimal ABI for the dispatcher.
//
// All three are authorized-recorder functions; the pool accounts must be
// authorized on-chain or every submission will revert in simulation.
abigen!(
    LeapChain,
    r#"[
        function recordJump(address player, uint256 height, uint256 score, string gameId)
        function recordGameOver(address player, uint256 score, string gameId)
        function setPlayer(address player, string name)
    ]"#
);
