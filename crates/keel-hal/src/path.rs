/// Partition path helper for block devices. Handles nvme/mmcblk/loop postfixing.
pub fn partition_path(disk: &str, num: u32) -> String {
    let needs_p = disk.contains("nvme")
        || disk.contains("mmcblk")
        || disk.contains("loop")
        || disk.ends_with(|c: char| c.is_ascii_digit());
    if needs_p {
        format!("{}p{}", disk, num)
    } else {
        format!("{}{}", disk, num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sd_devices_append_number() {
        assert_eq!(partition_path("/dev/sda", 3), "/dev/sda3");
        assert_eq!(partition_path("/dev/vdb", 6), "/dev/vdb6");
    }

    #[test]
    fn nvme_mmc_and_loop_devices_use_p_infix() {
        assert_eq!(partition_path("/dev/nvme0n1", 1), "/dev/nvme0n1p1");
        assert_eq!(partition_path("/dev/mmcblk0", 2), "/dev/mmcblk0p2");
        assert_eq!(partition_path("/dev/loop7", 5), "/dev/loop7p5");
    }
}
