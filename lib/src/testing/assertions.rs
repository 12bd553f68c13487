//! Assertion macros returning `TestResult::Fail` from the enclosing test.

#[macro_export]
macro_rules! assert_test {
    ($cond:expr) => {{
        if !$cond {
            $crate::log_info!("ASSERT: condition failed");
            return $crate::testing::TestResult::Fail;
        }
    }};
    ($cond:expr, $msg:expr) => {{
        if !$cond {
            $crate::log_info!("ASSERT: {}", $msg);
            return $crate::testing::TestResult::Fail;
        }
    }};
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {{
        if !$cond {
            $crate::log_info!(concat!("ASSERT: ", $fmt), $($arg)*);
            return $crate::testing::TestResult::Fail;
        }
    }};
}

#[macro_export]
macro_rules! assert_eq_test {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            $crate::log_info!("ASSERT_EQ: expected {:?}, got {:?}", right, left);
            return $crate::testing::TestResult::Fail;
        }
    }};
    ($left:expr, $right:expr, $msg:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            $crate::log_info!("ASSERT_EQ: {} - expected {:?}, got {:?}", $msg, right, left);
            return $crate::testing::TestResult::Fail;
        }
    }};
}

#[macro_export]
macro_rules! assert_ne_test {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left == right {
            $crate::log_info!("ASSERT_NE: values should differ, both are {:?}", left);
            return $crate::testing::TestResult::Fail;
        }
    }};
    ($left:expr, $right:expr, $msg:expr) => {{
        let left = $left;
        let right = $right;
        if left == right {
            $crate::log_info!("ASSERT_NE: {} - both are {:?}", $msg, left);
            return $crate::testing::TestResult::Fail;
        }
    }};
}

#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {{
        match $result {
            Ok(value) => value,
            Err(err) => {
                $crate::log_info!("ASSERT_OK: got Err({:?})", err);
                return $crate::testing::TestResult::Fail;
            }
        }
    }};
    ($result:expr, $msg:expr) => {{
        match $result {
            Ok(value) => value,
            Err(err) => {
                $crate::log_info!("ASSERT_OK: {} - got Err({:?})", $msg, err);
                return $crate::testing::TestResult::Fail;
            }
        }
    }};
}

#[macro_export]
macro_rules! assert_err_test {
    ($result:expr, $expected:expr) => {{
        match $result {
            Err(err) if err == $expected => {}
            Err(err) => {
                $crate::log_info!("ASSERT_ERR: expected {:?}, got Err({:?})", $expected, err);
                return $crate::testing::TestResult::Fail;
            }
            Ok(_) => {
                $crate::log_info!("ASSERT_ERR: expected {:?}, got Ok", $expected);
                return $crate::testing::TestResult::Fail;
            }
        }
    }};
}

#[macro_export]
macro_rules! assert_some {
    ($option:expr) => {{
        match $option {
            Some(value) => value,
            None => {
                $crate::log_info!("ASSERT_SOME: got None");
                return $crate::testing::TestResult::Fail;
            }
        }
    }};
    ($option:expr, $msg:expr) => {{
        match $option {
            Some(value) => value,
            None => {
                $crate::log_info!("ASSERT_SOME: {}", $msg);
                return $crate::testing::TestResult::Fail;
            }
        }
    }};
}
