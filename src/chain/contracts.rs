//! Type-safe bindings for the fixed external contracts this engine talks
//! to: the ERC-20 standard (for token sweeps and balance/allowance checks)
//! and the batch-processor contract (not redesigned here; its ABI is given).

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    #[sol(rpc)]
    contract ERC20 {
        function decimals() external view returns (uint8);
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);

        event Transfer(address indexed from, address indexed to, uint256 value);
    }

    #[sol(rpc)]
    contract WithdrawalProcessor {
        function processBatchNative(address[] recipients, uint256[] amounts) external payable;
        function processBatchErc20(address token, address[] recipients, uint256[] amounts) external;
    }
}
